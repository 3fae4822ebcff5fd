//! In-memory engine for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::{APP_CHANNEL, EVENT_CHANNEL, Envelope};
use crate::supervisor::{EngineSpawner, LaunchSpec, SpawnError, SpawnedEngine};

/// Bare project directory with a manifest.
pub(crate) fn project_dir(main: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_manifest(dir.path(), main);
    dir
}

/// Application root containing `app/<project>/package.json`.
pub(crate) fn app_dir(project: &str, main: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let project_path = dir.path().join("app").join(project);
    std::fs::create_dir_all(&project_path).unwrap();
    write_manifest(&project_path, main);
    dir
}

fn write_manifest(dir: &std::path::Path, main: &str) {
    let manifest = json!({"name": "test-engine", "main": main});
    std::fs::write(dir.join("package.json"), manifest.to_string()).unwrap();
}

/// Engine side of an in-memory transport.
pub(crate) struct FakeEngine {
    reader: FramedRead<ReadHalf<DuplexStream>, JsonLinesCodec<Envelope>>,
    writer: FramedWrite<WriteHalf<DuplexStream>, JsonLinesCodec<Envelope>>,
}

impl FakeEngine {
    pub(crate) async fn send_raw(&mut self, channel_name: &str, payload: &str) {
        self.writer
            .send(Envelope {
                channel_name: channel_name.to_string(),
                payload: payload.to_string(),
            })
            .await
            .unwrap();
    }

    pub(crate) async fn send_ready(&mut self) {
        self.send_raw(APP_CHANNEL, r#"{"event":"ready"}"#).await;
    }

    pub(crate) async fn send_event(&mut self, event: &str, args: Value) {
        let envelope = Envelope::event(event, &args).unwrap();
        assert_eq!(envelope.channel_name, EVENT_CHANNEL);
        self.writer.send(envelope).await.unwrap();
    }

    pub(crate) async fn recv(&mut self) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), self.reader.next())
            .await
            .expect("timed out waiting for host frame")
            .expect("host transport closed")
            .unwrap()
    }

    /// True if the host sends nothing within a short window.
    pub(crate) async fn is_quiet(&mut self) -> bool {
        tokio::time::timeout(Duration::from_millis(100), self.reader.next())
            .await
            .is_err()
    }
}

/// Spawner that hands out in-memory transports and records launches.
pub(crate) struct MemorySpawner {
    spawns: AtomicUsize,
    launches: Mutex<Vec<LaunchSpec>>,
    engine: Mutex<Option<FakeEngine>>,
}

impl MemorySpawner {
    pub(crate) fn new() -> Self {
        Self {
            spawns: AtomicUsize::new(0),
            launches: Mutex::new(Vec::new()),
            engine: Mutex::new(None),
        }
    }

    pub(crate) fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub(crate) fn last_launch(&self) -> Option<LaunchSpec> {
        self.launches.lock().unwrap().last().cloned()
    }

    pub(crate) fn take_engine(&self) -> Option<FakeEngine> {
        self.engine.lock().unwrap().take()
    }
}

impl EngineSpawner for MemorySpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedEngine, SpawnError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        self.launches.lock().unwrap().push(spec.clone());

        let (host, engine) = tokio::io::duplex(64 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (engine_read, engine_write) = tokio::io::split(engine);
        *self.engine.lock().unwrap() = Some(FakeEngine {
            reader: FramedRead::new(engine_read, JsonLinesCodec::new()),
            writer: FramedWrite::new(engine_write, JsonLinesCodec::new()),
        });
        Ok(SpawnedEngine::new(None, host_read, host_write))
    }
}
