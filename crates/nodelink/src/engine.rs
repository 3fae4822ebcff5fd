//! NodeEngine: host-facing API of the bridge.
//!
//! Composes the lifecycle tracker, the message router and the process supervisor
//! for exactly one engine process. Each instance owns its own lifecycle state.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use crate::bridge::protocol::ChannelPayload;
use crate::error::BridgeError;
use crate::notifier::EventNotifier;
use crate::project;
use crate::router::MessageRouter;
use crate::status::{EngineStatus, LifecycleState};
use crate::supervisor::{EngineSpawner, NodeIpcSpawner, ProcessSupervisor};

pub struct EngineConfig {
    /// Application root; projects live under `<app_path>/app/<project_dir>`.
    pub app_path: PathBuf,
    /// Appended to `NODE_PATH` after the project directory.
    pub module_paths: Vec<PathBuf>,
    pub spawner: Arc<dyn EngineSpawner>,
}

impl EngineConfig {
    pub fn new(app_path: impl Into<PathBuf>) -> Self {
        Self {
            app_path: app_path.into(),
            module_paths: Vec::new(),
            spawner: Arc::new(NodeIpcSpawner::from_env()),
        }
    }

    pub fn with_module_paths(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.module_paths.extend(paths);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn EngineSpawner>) -> Self {
        self.spawner = spawner;
        self
    }
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("app_path", &self.app_path)
            .field("module_paths", &self.module_paths)
            .finish_non_exhaustive()
    }
}

/// Bridge to one Node.js engine process.
pub struct NodeEngine {
    app_path: PathBuf,
    module_paths: Vec<PathBuf>,
    status: EngineStatus,
    router: MessageRouter,
    supervisor: ProcessSupervisor,
}

impl NodeEngine {
    pub fn new(config: EngineConfig, notifier: impl EventNotifier) -> Self {
        Self::with_notifier(config, Arc::new(notifier))
    }

    pub fn with_notifier(config: EngineConfig, notifier: Arc<dyn EventNotifier>) -> Self {
        let EngineConfig {
            app_path,
            module_paths,
            spawner,
        } = config;

        let status = EngineStatus::new();
        let router = MessageRouter::new(status.clone(), notifier);
        let supervisor = ProcessSupervisor::new(status.clone(), router.clone(), spawner);
        Self {
            app_path,
            module_paths,
            status,
            router,
            supervisor,
        }
    }

    /// Launch the engine for `<app_path>/app/<project_dir>`.
    ///
    /// Fails with [`BridgeError::AlreadyStarted`] on a second call, before anything is
    /// spawned. Does not wait for readiness.
    pub async fn start_engine(&self, project_dir: &str) -> Result<(), BridgeError> {
        let project_path = project::project_path(&self.app_path, project_dir);
        self.supervisor
            .start_engine(&project_path, &self.module_paths)
            .await
    }

    /// Resolves once the engine has sent its ready signal.
    ///
    /// Fails immediately with [`BridgeError::NotStarted`] before
    /// [`start_engine`](Self::start_engine). Waits indefinitely otherwise.
    pub fn resolve_when_ready(
        &self,
    ) -> impl Future<Output = Result<(), BridgeError>> + Send + 'static {
        self.supervisor.resolve_when_ready()
    }

    /// Send an application event to the engine.
    ///
    /// Fails with [`BridgeError::NotStarted`] or [`BridgeError::NotReady`] when the
    /// engine cannot take events yet. A message without event name or args is dropped
    /// silently.
    pub fn send_message(&self, message: &ChannelPayload) -> Result<(), BridgeError> {
        match self.router.outbound(message)? {
            Some(envelope) => self.supervisor.send(envelope),
            None => Ok(()),
        }
    }

    pub fn emit(
        &self,
        event_name: impl Into<String>,
        args: serde_json::Value,
    ) -> Result<(), BridgeError> {
        self.send_message(&ChannelPayload::new(event_name, args))
    }

    pub fn state(&self) -> LifecycleState {
        self.status.state()
    }

    pub fn is_started(&self) -> bool {
        self.status.is_started()
    }

    pub fn is_ready(&self) -> bool {
        self.status.is_ready()
    }

    /// OS process id of the engine, when one was spawned.
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }
}

impl std::fmt::Debug for NodeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEngine")
            .field("app_path", &self.app_path)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
