//! nodelink: lifecycle-synchronized message bridge to a Node.js engine subprocess.

mod error;
mod notifier;
mod project;
mod router;
mod status;

pub mod bridge;
pub mod engine;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use engine::{EngineConfig, NodeEngine};

pub use bridge::protocol::{APP_CHANNEL, ChannelPayload, EVENT_CHANNEL, Envelope, READY_EVENT};
pub use error::BridgeError;
pub use notifier::{ChannelEvent, ChannelNotifier, EventNotifier};
pub use project::{EntryPoint, PackageManifest, ProjectError};
pub use router::{MessageRouter, Routed};
pub use status::{EngineStatus, LifecycleState, LifecycleTracker, ReadyWaiter, ReadyWaiters};
pub use supervisor::{
    EngineSpawner, LaunchSpec, NodeIpcSpawner, ProcessSupervisor, SpawnError, SpawnedEngine,
    StdioSpawner,
};
