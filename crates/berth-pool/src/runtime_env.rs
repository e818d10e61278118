use crate::id::JobId;
use crate::job::RuntimeEnvConfig;

/// The runtime environment agent, an external service that materializes
/// serialized runtime environments. The agent owns request coalescing and
/// reference counting; the pool takes one reference per start attempt and
/// releases one reference per failed or completed attempt.
#[tonic::async_trait]
pub trait RuntimeEnvAgent: Send + Sync + 'static {
    /// Materialize a runtime environment and return the serialized context
    /// to pass to the worker, or a setup error message.
    async fn get_or_create(
        &self,
        job_id: Option<JobId>,
        serialized_runtime_env: String,
        config: RuntimeEnvConfig,
    ) -> Result<String, String>;

    /// Release a reference on a runtime environment and delete it when it is
    /// no longer referenced. Returns whether the release was performed.
    async fn delete_if_possible(&self, serialized_runtime_env: String) -> bool;
}
