use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::client::WorkerClient;
use crate::error::PoolResult;
use crate::id::{JobId, PopRequestId, StartupToken, WorkerId};
use crate::job::JobConfig;
use crate::pool::{
    IoWorkerCallback, PoolSnapshot, PopWorkerCallback, PopWorkerRequest, PopWorkerStatus,
    WorkerAssignment,
};
use crate::task::TaskSpec;
use crate::worker::{Language, WorkerType};

pub enum PoolEvent {
    /// The node manager gRPC server is ready on the given local port. The
    /// port is substituted into worker commands, so no worker can be
    /// launched before this event.
    ServerReady {
        port: u16,
    },
    /// A launched worker process identifies itself. The reply carries the
    /// port the worker should listen on (0 lets the worker choose).
    RegisterWorker {
        worker_id: WorkerId,
        language: Language,
        worker_type: WorkerType,
        pid: u32,
        startup_token: StartupToken,
        runtime_env_hash: u64,
        client: Arc<dyn WorkerClient>,
        reply: oneshot::Sender<PoolResult<u16>>,
    },
    RegisterDriver {
        worker_id: WorkerId,
        language: Language,
        job_id: JobId,
        job_config: JobConfig,
        reply: oneshot::Sender<PoolResult<u16>>,
    },
    /// The startup handshake of a registered worker completed.
    WorkerStarted {
        worker_id: WorkerId,
    },
    /// A task needs a worker. The callback fires exactly once with the
    /// outcome.
    PopWorker {
        spec: TaskSpec,
        callback: PopWorkerCallback,
    },
    /// A consumer returns a worker to the pool, or a newly started worker
    /// becomes available.
    PushWorker {
        worker_id: WorkerId,
    },
    /// Best-effort prestart for a task submission with a backlog.
    PrestartWorkers {
        spec: TaskSpec,
        backlog_size: i64,
    },
    PopIoWorker {
        worker_type: WorkerType,
        callback: IoWorkerCallback,
    },
    PushIoWorker {
        worker_id: WorkerId,
    },
    /// Pop an I/O worker for object deletion from whichever sub-pool has
    /// fewer idle workers.
    PopDeleteWorker {
        callback: IoWorkerCallback,
    },
    JobStarted {
        job_id: JobId,
        job_config: JobConfig,
    },
    JobFinished {
        job_id: JobId,
    },
    DisconnectWorker {
        worker_id: WorkerId,
    },
    DisconnectDriver {
        worker_id: WorkerId,
    },
    /// Registration-timeout timer for a spawned process.
    ProbeStartingWorkerProcess {
        language: Language,
        startup_token: StartupToken,
    },
    /// Registration-wait timer for a pop request parked behind a spawned
    /// process.
    ProbePendingPopRequest {
        language: Language,
        request_id: PopRequestId,
    },
    /// Periodic idle worker eviction sweep.
    TickIdleWorkerEviction,
    /// The runtime environment agent answered a creation request for a pop
    /// request.
    RuntimeEnvCreated {
        request: PopWorkerRequest,
        result: Result<String, String>,
    },
    /// The runtime environment agent answered a creation request for a
    /// prestart.
    PrestartRuntimeEnvCreated {
        spec: TaskSpec,
        serialized_context: String,
    },
    /// Deferred pop callback dispatch; invoked one tick after the decision
    /// so callers do not observe mid-mutation state.
    CompletePopWorker {
        callback: PopWorkerCallback,
        worker_id: Option<WorkerId>,
        assignment: Option<WorkerAssignment>,
        status: PopWorkerStatus,
        message: Option<String>,
    },
    /// A worker answered an exit request sent by the eviction sweep.
    WorkerExitReplied {
        worker_id: WorkerId,
        keep_alive_until: Instant,
        killed: bool,
    },
    ObservePool {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    Shutdown,
}
