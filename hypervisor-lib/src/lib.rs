use hypervisor_reconciler::ReconcileError;
use thiserror::Error;

pub mod context;
pub mod jobs;
pub mod state;

pub const HYPERVISOR_UPDATE_JOB_ID: u64 = 0;
pub const HYPERVISOR_HEARTBEAT_JOB_ID: u64 = 1;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid job configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid job input: {0}")]
    InvalidInput(String),
    /// Run-level failure; displays the reconciler's own message.
    #[error("{0}")]
    Failed(#[from] ReconcileError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_job_keeps_engine_message() {
        let err: JobError = ReconcileError::AutobindDisabled {
            owner_key: "joe".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Could not update host/guest mapping. Auto-attach is disabled for owner joe."
        );
    }
}
