use thiserror::Error;

/// Failure taxonomy of a run. Components propagate these wrapped in
/// `anyhow::Error`; the CLI downcasts to pick its final message.
#[derive(Debug, Error)]
pub enum SpeedrunError {
    #[error("no GPU offers found in any search tier")]
    NoResourceAvailable,

    #[error("instance provisioning failed: {0}")]
    Provisioning(String),

    #[error("unexpected marketplace response: {0}")]
    BackendProtocol(String),

    #[error("instance {contract_id} did not reach running state within {waited_secs}s")]
    ReadyTimeout { contract_id: u64, waited_secs: u64 },

    #[error("deployment failed: {0}")]
    Deployment(String),

    #[error("training job exited with status {exit_code}")]
    JobFailed { exit_code: i32 },

    #[error("run cancelled")]
    Cancelled,
}

impl SpeedrunError {
    /// True when the user's program failed, as opposed to the infrastructure.
    pub fn is_job_failure(&self) -> bool {
        matches!(self, SpeedrunError::JobFailed { .. })
    }
}
