// Hypervisor reconciler - reconciles host/guest reports against known consumers
use hypervisor_common::{Access, ModelError};
use thiserror::Error;

mod auth;
mod guests;
mod ids;
mod matcher;
mod normalize;
mod outcome;
mod persister;
mod planner;
mod reconciler;
mod report;
mod storage;

pub use auth::{Authorizer, PrincipalAuthorizer};
pub use guests::{replace_guests, GuestDiff};
pub use ids::{IdGenerator, UuidGenerator};
pub use matcher::{identity_override, IdentityMatcher, MatchDecision};
pub use normalize::{normalize, HostEntry};
pub use outcome::{
    ConsumerSummary, GuestMigration, HostState, OutcomeBuilder, OwnerRef, ReconciliationOutcome,
};
pub use persister::BatchPersister;
pub use planner::{ChangeSet, FailureKind, Mutation, MutationPlanner};
pub use reconciler::{HeartbeatOutcome, ReconcileRequest, Reconciler};
pub use report::{HypervisorReport, ReportedGuestId, ReportedHypervisor, ReportedHypervisorId};
pub use storage::{
    ConsumerStore, GuestConsumerMap, HostConsumerMap, InMemoryStore, StoreSnapshot, StoreStats,
    UnitOfWork,
};

// Error Types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Backend(String),
    #[error("{0}")]
    Rejected(String),
    #[error("Concurrent modification detected for owner {owner_key}")]
    Conflict { owner_key: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Owner with key {0} was not found")]
    OwnerNotFound(String),
    #[error("Could not update host/guest mapping. Auto-attach is disabled for owner {owner_key}.")]
    AutobindDisabled { owner_key: String },
    #[error("{principal} does not have {required:?} access to owner {owner_key}")]
    AccessDenied {
        principal: String,
        owner_key: String,
        required: Access,
    },
    #[error("Invalid consumer: {0}")]
    Model(#[from] ModelError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
