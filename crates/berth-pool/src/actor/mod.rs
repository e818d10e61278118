mod core;
mod handler;

use std::sync::Arc;

use crate::pool::{WorkerPool, WorkerPoolOptions};
use crate::ports::PortProbe;
use crate::process::ProcessSpawner;
use crate::resources::NodeResources;
use crate::runtime_env::RuntimeEnvAgent;

/// The worker pool actor. All pool state is mutated on its single-threaded
/// event loop; timers are delayed self-sends and RPCs are spawned tasks
/// that complete by sending events back.
pub struct PoolActor {
    pool: WorkerPool,
}

pub struct PoolActorOptions {
    pub options: WorkerPoolOptions,
    pub spawner: Arc<dyn ProcessSpawner>,
    pub runtime_env_agent: Arc<dyn RuntimeEnvAgent>,
    pub resources: Arc<dyn NodeResources>,
    pub port_probe: Box<dyn PortProbe>,
}
