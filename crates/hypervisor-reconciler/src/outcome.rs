use crate::planner::FailureKind;
use hypervisor_common::Consumer;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub key: String,
}

/// Shape of one consumer in the result payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerSummary {
    pub uuid: String,
    pub name: String,
    pub owner: OwnerRef,
}

impl From<&Consumer> for ConsumerSummary {
    fn from(consumer: &Consumer) -> Self {
        Self {
            uuid: consumer.uuid.clone(),
            name: consumer.name.clone(),
            owner: OwnerRef {
                key: consumer.owner_key.clone(),
            },
        }
    }
}

/// A registered guest consumer that showed up under a host it was not listed on before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestMigration {
    pub guest_id: String,
    pub guest_uuid: String,
    pub host_uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationOutcome {
    /// `None` when the run was not allowed to create hosts and updated none
    /// either; an empty list otherwise.
    pub created: Option<Vec<ConsumerSummary>>,
    pub updated: Vec<ConsumerSummary>,
    pub failed_create: Vec<String>,
    pub failed_update: Vec<String>,
    #[serde(skip)]
    pub migrated_guests: Vec<GuestMigration>,
}

impl ReconciliationOutcome {
    /// Number of hosts accounted for.
    pub fn total(&self) -> usize {
        self.created.as_ref().map_or(0, Vec::len)
            + self.updated.len()
            + self.failed_create.len()
            + self.failed_update.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostState {
    Created(ConsumerSummary),
    Updated(ConsumerSummary),
    FailedCreate(String),
    FailedUpdate(String),
}

impl HostState {
    pub fn is_success(&self) -> bool {
        matches!(self, HostState::Created(_) | HostState::Updated(_))
    }
}

/// Collects exactly one outcome per host key, in the order hosts were recorded.
#[derive(Debug, Default)]
pub struct OutcomeBuilder {
    create_missing: bool,
    order: Vec<String>,
    states: HashMap<String, HostState>,
    migrated_guests: Vec<GuestMigration>,
}

impl OutcomeBuilder {
    pub fn new(create_missing: bool) -> Self {
        Self {
            create_missing,
            ..Default::default()
        }
    }

    /// Returns false, and keeps the first outcome, if the host already has one.
    pub fn record(&mut self, host_key: &str, state: HostState) -> bool {
        let key = host_key.to_lowercase();
        if self.states.contains_key(&key) {
            warn!(host = %host_key, "Ignoring second outcome for host");
            return false;
        }
        self.order.push(key.clone());
        self.states.insert(key, state);
        true
    }

    pub fn created(&mut self, host_key: &str, consumer: &Consumer) -> bool {
        self.record(host_key, HostState::Created(consumer.into()))
    }

    pub fn updated(&mut self, host_key: &str, consumer: &Consumer) -> bool {
        self.record(host_key, HostState::Updated(consumer.into()))
    }

    pub fn failed(&mut self, kind: FailureKind, host_key: &str, message: impl Into<String>) -> bool {
        let message = message.into();
        let state = match kind {
            FailureKind::Create => HostState::FailedCreate(message),
            FailureKind::Update => HostState::FailedUpdate(message),
        };
        self.record(host_key, state)
    }

    pub fn migrated(&mut self, migration: GuestMigration) {
        self.migrated_guests.push(migration);
    }

    pub fn state(&self, host_key: &str) -> Option<&HostState> {
        self.states.get(&host_key.to_lowercase())
    }

    pub fn succeeded(&self, host_key: &str) -> bool {
        self.state(host_key).is_some_and(HostState::is_success)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn finish(mut self) -> ReconciliationOutcome {
        let mut created = Vec::new();
        let mut outcome = ReconciliationOutcome {
            migrated_guests: std::mem::take(&mut self.migrated_guests),
            ..Default::default()
        };
        for key in &self.order {
            match self.states.remove(key) {
                Some(HostState::Created(summary)) => created.push(summary),
                Some(HostState::Updated(summary)) => outcome.updated.push(summary),
                Some(HostState::FailedCreate(message)) => outcome.failed_create.push(message),
                Some(HostState::FailedUpdate(message)) => outcome.failed_update.push(message),
                None => {}
            }
        }
        outcome.created =
            (self.create_missing || !outcome.updated.is_empty()).then_some(created);
        outcome
    }
}
