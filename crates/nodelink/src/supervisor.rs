//! Process supervisor - owns the engine subprocess and its transport.
//!
//! Flow:
//! 1. Reject a second start before any side effect
//! 2. Resolve the project entry point and module search path
//! 3. Spawn the engine through an [`EngineSpawner`]
//! 4. Run a writer task draining the outbound queue into the transport
//! 5. Run a reader task handing every inbound frame to the [`MessageRouter`]

use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::Envelope;
use crate::error::BridgeError;
use crate::project::{self, EntryPoint};
use crate::router::MessageRouter;
use crate::status::EngineStatus;

/// Module search path variable read by Node.js.
pub const MODULE_PATH_ENV: &str = "NODE_PATH";
/// Environment override for the Node.js binary used by [`NodeIpcSpawner::from_env`].
pub const NODE_BINARY_ENV: &str = "NODELINK_NODE";
/// fd the Node IPC channel is installed on in the child.
pub const NODE_CHANNEL_FD: i32 = 3;

/// Everything a spawner needs to launch the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub entry: EntryPoint,
    /// Value for [`MODULE_PATH_ENV`].
    pub module_path: OsString,
}

pub type EngineReader = Box<dyn AsyncRead + Send + Unpin>;
pub type EngineWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A launched engine: the process (if any) and the duplex transport to it.
pub struct SpawnedEngine {
    pub child: Option<Child>,
    pub reader: EngineReader,
    pub writer: EngineWriter,
}

impl SpawnedEngine {
    pub fn new(
        child: Option<Child>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            child,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn process: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{0} not captured")]
    MissingPipe(&'static str),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different engine launch strategies.
pub trait EngineSpawner: Send + Sync {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedEngine, SpawnError>;
}

fn engine_command(program: &OsStr, args: &[OsString], spec: &LaunchSpec) -> Command {
    let mut command = Command::new(program);
    command
        .args(args)
        .arg(&spec.entry.main_path)
        .current_dir(&spec.entry.project_path)
        .env(MODULE_PATH_ENV, &spec.module_path)
        .kill_on_drop(true);
    command
}

/// Spawns `node` the way `child_process.fork` does, with a JSON IPC channel.
///
/// One end of a socketpair becomes fd 3 in the child and is announced through
/// `NODE_CHANNEL_FD`, so the engine talks with `process.send` and
/// `process.on('message')`. The child's stdout and stderr are inherited.
#[derive(Debug, Clone)]
pub struct NodeIpcSpawner {
    node_binary: OsString,
    node_args: Vec<OsString>,
}

impl Default for NodeIpcSpawner {
    fn default() -> Self {
        Self {
            node_binary: OsString::from("node"),
            node_args: Vec::new(),
        }
    }
}

impl NodeIpcSpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default spawner, honoring [`NODE_BINARY_ENV`].
    pub fn from_env() -> Self {
        match std::env::var_os(NODE_BINARY_ENV) {
            Some(binary) if !binary.is_empty() => Self::new().with_node_binary(binary),
            _ => Self::new(),
        }
    }

    pub fn with_node_binary(mut self, binary: impl Into<OsString>) -> Self {
        self.node_binary = binary.into();
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.node_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl EngineSpawner for NodeIpcSpawner {
    #[cfg(unix)]
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedEngine, SpawnError> {
        use std::os::fd::AsRawFd;

        let (parent_end, child_end) = std::os::unix::net::UnixStream::pair()?;
        let child_fd = child_end.as_raw_fd();

        let mut command = engine_command(&self.node_binary, &self.node_args, spec);
        command
            .env("NODE_CHANNEL_FD", NODE_CHANNEL_FD.to_string())
            .env("NODE_CHANNEL_SERIALIZATION_MODE", "json")
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: the closure runs between fork and exec and only calls dup2/fcntl,
        // which are async-signal-safe. child_fd stays open in the parent until spawn
        // returns because child_end is dropped afterwards.
        unsafe {
            command.pre_exec(move || {
                if child_fd == NODE_CHANNEL_FD {
                    let flags = libc::fcntl(child_fd, libc::F_GETFD);
                    if flags < 0
                        || libc::fcntl(child_fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0
                    {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if libc::dup2(child_fd, NODE_CHANNEL_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        tracing::debug!(
            node = ?self.node_binary,
            main = %spec.entry.main_path.display(),
            "Spawning node with IPC channel"
        );
        let child = command.spawn()?;
        drop(child_end);

        parent_end.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(parent_end)?;
        let (reader, writer) = stream.into_split();
        Ok(SpawnedEngine::new(Some(child), reader, writer))
    }

    #[cfg(not(unix))]
    fn spawn(&self, _spec: &LaunchSpec) -> Result<SpawnedEngine, SpawnError> {
        Err(SpawnError::Other(
            "the Node IPC channel requires a unix platform; use StdioSpawner".to_string(),
        ))
    }
}

/// Spawns an arbitrary program with the entry point as its last argument and uses
/// the child's stdin/stdout as the transport.
#[derive(Debug, Clone)]
pub struct StdioSpawner {
    program: OsString,
    args: Vec<OsString>,
}

impl StdioSpawner {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl EngineSpawner for StdioSpawner {
    fn spawn(&self, spec: &LaunchSpec) -> Result<SpawnedEngine, SpawnError> {
        let mut command = engine_command(&self.program, &self.args, spec);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        tracing::debug!(
            program = ?self.program,
            main = %spec.entry.main_path.display(),
            "Spawning engine over stdio"
        );
        let mut child = command.spawn()?;
        let stdin = child.stdin.take().ok_or(SpawnError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe("stdout"))?;
        Ok(SpawnedEngine::new(Some(child), stdout, stdin))
    }
}

/// Live handle to the engine: the outbound queue and the process watcher.
pub struct EngineHandle {
    outbound: mpsc::UnboundedSender<Envelope>,
    pid: Option<u32>,
    // Dropping the handle stops the process watcher, which kills the engine.
    _release: Option<oneshot::Sender<()>>,
}

impl EngineHandle {
    /// Queue one envelope. Frames are written in call order.
    pub fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        self.outbound
            .send(envelope)
            .map_err(|_| BridgeError::TransportClosed)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Inbound half of a connected engine, not yet forwarding.
pub struct EngineInbound {
    reader: FramedRead<EngineReader, JsonLinesCodec<Envelope>>,
}

impl EngineInbound {
    pub fn forward_to(self, router: MessageRouter) -> JoinHandle<()> {
        tokio::spawn(run_reader(self.reader, router))
    }
}

/// Start the writer task and process watcher for a freshly spawned engine.
///
/// Inbound frames are not read until [`EngineInbound::forward_to`] is called, so the
/// caller can publish the handle first.
pub fn connect(spawned: SpawnedEngine) -> (EngineHandle, EngineInbound) {
    let SpawnedEngine {
        child,
        reader,
        writer,
    } = spawned;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let writer = FramedWrite::new(writer, JsonLinesCodec::<Envelope>::new());
    tokio::spawn(run_writer(writer, outbound_rx));

    let (pid, release) = match child {
        Some(child) => {
            let pid = child.id();
            let (release_tx, release_rx) = oneshot::channel();
            tokio::spawn(watch_process(child, release_rx));
            (pid, Some(release_tx))
        }
        None => (None, None),
    };

    let handle = EngineHandle {
        outbound: outbound_tx,
        pid,
        _release: release,
    };
    let inbound = EngineInbound {
        reader: FramedRead::new(reader, JsonLinesCodec::<Envelope>::new()),
    };
    (handle, inbound)
}

async fn run_writer(
    mut writer: FramedWrite<EngineWriter, JsonLinesCodec<Envelope>>,
    mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = outbound_rx.recv().await {
        if let Err(e) = writer.send(envelope).await {
            tracing::error!(error = %e, "Failed to write to engine");
            break;
        }
    }
    tracing::debug!("Engine writer exiting");
}

async fn run_reader(
    mut reader: FramedRead<EngineReader, JsonLinesCodec<Envelope>>,
    router: MessageRouter,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(envelope) => {
                tracing::trace!(channel = %envelope.channel_name, "Inbound frame");
                router.receive_envelope(&envelope);
            }
            Err(e) => {
                tracing::error!(error = %e, "Engine channel error");
                break;
            }
        }
    }
    tracing::info!("Engine channel closed");
}

async fn watch_process(mut child: Child, mut release: oneshot::Receiver<()>) {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => tracing::info!(%status, "Engine process exited"),
            Err(e) => tracing::warn!(error = %e, "Failed to wait for engine process"),
        },
        _ = &mut release => {
            tracing::debug!("Engine handle released, stopping engine process");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to stop engine process");
            }
        }
    }
}

/// Owns the single engine process of one bridge instance.
pub struct ProcessSupervisor {
    status: EngineStatus,
    router: MessageRouter,
    spawner: Arc<dyn EngineSpawner>,
    handle: Mutex<Option<EngineHandle>>,
}

impl ProcessSupervisor {
    pub fn new(status: EngineStatus, router: MessageRouter, spawner: Arc<dyn EngineSpawner>) -> Self {
        Self {
            status,
            router,
            spawner,
            handle: Mutex::new(None),
        }
    }

    fn lock_handle(&self) -> MutexGuard<'_, Option<EngineHandle>> {
        self.handle.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Engine handle mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    /// Launch the engine for the project at `project_path`.
    ///
    /// Completes once the spawn has been issued; readiness is awaited separately with
    /// [`resolve_when_ready`](Self::resolve_when_ready). A failure after the start check
    /// leaves the engine `Started`.
    pub async fn start_engine(
        &self,
        project_path: &Path,
        extra_module_paths: &[PathBuf],
    ) -> Result<(), BridgeError> {
        if !self.status.try_mark_started() {
            return Err(BridgeError::AlreadyStarted);
        }

        tracing::info!(project = %project_path.display(), "Starting engine");
        let entry = project::resolve_entry_point(project_path).await?;
        let module_path = project::module_search_path(&entry.project_path, extra_module_paths)?;
        let spec = LaunchSpec { entry, module_path };

        let spawned = self.spawner.spawn(&spec)?;
        let (handle, inbound) = connect(spawned);
        tracing::info!(pid = ?handle.pid(), "Engine spawned, waiting for ready signal");

        *self.lock_handle() = Some(handle);
        inbound.forward_to(self.router.clone());
        Ok(())
    }

    /// Resolves once the engine is ready.
    ///
    /// Registration happens when this is called, not when the future is first polled.
    /// Fails immediately with [`BridgeError::NotStarted`] before `start_engine`. There is
    /// no timeout; wrap in `tokio::time::timeout` if needed.
    pub fn resolve_when_ready(
        &self,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send + 'static {
        let signal = self.status.ready_signal();
        async move {
            signal?.await.map_err(|_| BridgeError::Abandoned)
        }
    }

    /// Transport send primitive. A no-op when no engine is attached.
    pub fn send(&self, envelope: Envelope) -> Result<(), BridgeError> {
        match self.lock_handle().as_ref() {
            Some(handle) => handle.send(envelope),
            None => {
                tracing::warn!(channel = %envelope.channel_name, "No engine attached, dropping frame");
                Ok(())
            }
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock_handle().as_ref().and_then(EngineHandle::pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Channel, EVENT_CHANNEL};
    use crate::notifier::ChannelNotifier;
    use crate::status::LifecycleState;
    use crate::testing::{MemorySpawner, project_dir};
    use serde_json::json;
    use std::time::Duration;

    fn supervisor(spawner: Arc<dyn EngineSpawner>) -> (ProcessSupervisor, EngineStatus) {
        let status = EngineStatus::new();
        let (notifier, _rx) = ChannelNotifier::new();
        let router = MessageRouter::new(status.clone(), Arc::new(notifier));
        (ProcessSupervisor::new(status.clone(), router, spawner), status)
    }

    #[tokio::test]
    async fn start_spawns_with_resolved_entry_and_module_path() {
        let dir = project_dir("main.js");
        let spawner = Arc::new(MemorySpawner::new());
        let (supervisor, status) = supervisor(spawner.clone());

        let extra = vec![PathBuf::from("/opt/bridge")];
        supervisor.start_engine(dir.path(), &extra).await.unwrap();

        assert_eq!(status.state(), LifecycleState::Started);
        let spec = spawner.last_launch().unwrap();
        assert_eq!(spec.entry.main_path, dir.path().join("main.js"));
        let paths: Vec<PathBuf> = std::env::split_paths(&spec.module_path).collect();
        assert_eq!(paths, vec![dir.path().to_path_buf(), extra[0].clone()]);
    }

    #[tokio::test]
    async fn second_start_fails_without_spawning() {
        let dir = project_dir("index.js");
        let spawner = Arc::new(MemorySpawner::new());
        let (supervisor, _) = supervisor(spawner.clone());

        supervisor.start_engine(dir.path(), &[]).await.unwrap();
        let err = supervisor.start_engine(dir.path(), &[]).await.unwrap_err();

        assert!(matches!(err, BridgeError::AlreadyStarted));
        assert_eq!(spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn resolve_when_ready_before_start_fails() {
        let (supervisor, status) = supervisor(Arc::new(MemorySpawner::new()));
        let err = supervisor.resolve_when_ready().await.unwrap_err();
        assert!(matches!(err, BridgeError::NotStarted));
        assert_eq!(status.state(), LifecycleState::NotStarted);
    }

    #[tokio::test]
    async fn ready_frame_resolves_all_waiters() {
        let dir = project_dir("index.js");
        let spawner = Arc::new(MemorySpawner::new());
        let (supervisor, status) = supervisor(spawner.clone());
        supervisor.start_engine(dir.path(), &[]).await.unwrap();

        let first = tokio::spawn(supervisor.resolve_when_ready());
        let second = tokio::spawn(supervisor.resolve_when_ready());

        let mut engine = spawner.take_engine().unwrap();
        engine.send_ready().await;

        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap().unwrap();
            second.await.unwrap().unwrap();
        })
        .await
        .unwrap();
        assert!(status.is_ready());

        // Late waiter resolves immediately.
        supervisor.resolve_when_ready().await.unwrap();
    }

    #[tokio::test]
    async fn sends_are_written_in_call_order() {
        let dir = project_dir("index.js");
        let spawner = Arc::new(MemorySpawner::new());
        let (supervisor, _) = supervisor(spawner.clone());
        supervisor.start_engine(dir.path(), &[]).await.unwrap();
        let mut engine = spawner.take_engine().unwrap();

        for n in 0..3 {
            supervisor
                .send(Envelope::event("tick", &json!(n)).unwrap())
                .unwrap();
        }

        for n in 0..3 {
            let envelope = engine.recv().await;
            assert_eq!(envelope.channel_name, EVENT_CHANNEL);
            assert_eq!(envelope.decode_payload().unwrap().args(), json!(n));
        }
    }

    #[test]
    fn send_without_engine_is_noop() {
        let (supervisor, _) = supervisor(Arc::new(MemorySpawner::new()));
        supervisor
            .send(Envelope::new(Channel::Event, "{}"))
            .unwrap();
        assert_eq!(supervisor.pid(), None);
    }

    #[tokio::test]
    async fn send_after_transport_closes_fails() {
        let dir = project_dir("index.js");
        let spawner = Arc::new(MemorySpawner::new());
        let (supervisor, _) = supervisor(spawner.clone());
        supervisor.start_engine(dir.path(), &[]).await.unwrap();

        drop(spawner.take_engine().unwrap());

        // The writer notices the closed pipe on its first write, then stops.
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match supervisor.send(Envelope::new(Channel::Event, "{}")) {
                    Err(err) => return err,
                    Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(result, BridgeError::TransportClosed));
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_and_keeps_started() {
        let dir = project_dir("index.js");
        let spawner = Arc::new(
            NodeIpcSpawner::new().with_node_binary("/nonexistent/nodelink-test-node"),
        );
        let (supervisor, status) = supervisor(spawner);

        let err = supervisor.start_engine(dir.path(), &[]).await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn(_)));
        assert_eq!(status.state(), LifecycleState::Started);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdio_spawner_relays_through_real_process() {
        // Announces readiness, then echoes the first frame it receives back to the host.
        const ECHO_ENGINE: &str = r#"printf '%s\n' '{"channelName":"APP_CHANNEL","payload":"{\"event\":\"ready\"}"}'
read -r line
printf '%s\n' "$line"
"#;

        let dir = project_dir("index.js");
        let spawner = Arc::new(StdioSpawner::new("sh").with_args(["-c", ECHO_ENGINE, "engine"]));

        let status = EngineStatus::new();
        let (notifier, mut events) = ChannelNotifier::new();
        let router = MessageRouter::new(status.clone(), Arc::new(notifier));
        let supervisor = ProcessSupervisor::new(status.clone(), router.clone(), spawner);

        supervisor.start_engine(dir.path(), &[]).await.unwrap();
        assert!(supervisor.pid().is_some());
        tokio::time::timeout(Duration::from_secs(10), supervisor.resolve_when_ready())
            .await
            .unwrap()
            .unwrap();

        let message = crate::bridge::protocol::ChannelPayload::new("echo", json!({"x": 1}));
        let envelope = router.outbound(&message).unwrap().unwrap();
        supervisor.send(envelope).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_name, "echo");
        assert_eq!(event.args, json!({"x": 1}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn node_ipc_spawner_talks_over_channel_fd() {
        // Checks the fork-style environment, announces readiness on fd 3, then echoes
        // the first frame it receives there.
        const IPC_ENGINE: &str = r#"[ "$NODE_CHANNEL_FD" = 3 ] || exit 1
[ "$NODE_CHANNEL_SERIALIZATION_MODE" = json ] || exit 1
printf '%s\n' '{"channelName":"APP_CHANNEL","payload":"{\"event\":\"ready\"}"}' >&3
read -r line <&3
printf '%s\n' "$line" >&3
"#;

        let dir = project_dir("index.js");
        let spawner = Arc::new(
            NodeIpcSpawner::new()
                .with_node_binary("sh")
                .with_args(["-c", IPC_ENGINE, "engine"]),
        );

        let status = EngineStatus::new();
        let (notifier, mut events) = ChannelNotifier::new();
        let router = MessageRouter::new(status.clone(), Arc::new(notifier));
        let supervisor = ProcessSupervisor::new(status.clone(), router.clone(), spawner);

        supervisor.start_engine(dir.path(), &[]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), supervisor.resolve_when_ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state(), LifecycleState::Ready);

        let message = crate::bridge::protocol::ChannelPayload::new("echo", json!(["hi"]));
        let envelope = router.outbound(&message).unwrap().unwrap();
        supervisor.send(envelope).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_name, "echo");
        assert_eq!(event.args, json!(["hi"]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_stdout_line_does_not_stop_routing() {
        const NOISY_ENGINE: &str = r#"printf 'garbage \377\n'
printf '%s\n' '{"channelName":"APP_CHANNEL","payload":"{\"event\":\"ready\"}"}'
"#;

        let dir = project_dir("index.js");
        let spawner = Arc::new(StdioSpawner::new("sh").with_args(["-c", NOISY_ENGINE, "engine"]));

        let status = EngineStatus::new();
        let (notifier, _events) = ChannelNotifier::new();
        let router = MessageRouter::new(status.clone(), Arc::new(notifier));
        let supervisor = ProcessSupervisor::new(status.clone(), router, spawner);

        supervisor.start_engine(dir.path(), &[]).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), supervisor.resolve_when_ready())
            .await
            .unwrap()
            .unwrap();
        assert!(status.is_ready());
    }
}
