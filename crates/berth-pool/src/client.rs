use crate::error::PoolResult;

/// The RPC surface the pool consumes from a registered worker.
/// The transport implementation lives with the daemon; the registration
/// event carries the client for the new worker.
#[tonic::async_trait]
pub trait WorkerClient: Send + Sync + 'static {
    /// Ask the worker to exit, allowing it to do cleanup first.
    /// Returns whether the worker agreed to exit. With `force_exit` the
    /// worker must exit even if it still owns objects.
    async fn exit(&self, force_exit: bool) -> PoolResult<bool>;
}
