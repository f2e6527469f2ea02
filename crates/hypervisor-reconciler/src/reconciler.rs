use crate::auth::{Authorizer, PrincipalAuthorizer};
use crate::ids::{IdGenerator, UuidGenerator};
use crate::matcher::IdentityMatcher;
use crate::normalize::{normalize, HostEntry};
use crate::outcome::{GuestMigration, OutcomeBuilder, ReconciliationOutcome};
use crate::persister::BatchPersister;
use crate::planner::{Mutation, MutationPlanner};
use crate::report::HypervisorReport;
use crate::storage::{ConsumerStore, GuestConsumerMap, UnitOfWork};
use crate::{ReconcileError, Result};
use chrono::{DateTime, Utc};
use hypervisor_common::{Access, Consumer, Owner, Principal};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Everything one reconciliation run needs.
#[derive(Debug, Clone)]
pub struct ReconcileRequest {
    pub owner_key: String,
    pub create_missing: bool,
    pub reporter_id: Option<String>,
    pub principal: Principal,
    pub report: HypervisorReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatOutcome {
    pub owner_key: String,
    pub reporter_id: String,
    pub updated: usize,
}

/// Reconciles hypervisor reports against the consumer store.
pub struct Reconciler {
    store: Arc<dyn ConsumerStore>,
    authorizer: Arc<dyn Authorizer>,
    ids: Arc<dyn IdGenerator>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConsumerStore>,
        authorizer: Arc<dyn Authorizer>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            store,
            authorizer,
            ids,
        }
    }

    pub fn with_defaults(store: Arc<dyn ConsumerStore>) -> Self {
        Self::new(store, Arc::new(PrincipalAuthorizer), Arc::new(UuidGenerator))
    }

    /// Runs one reconciliation inside a single unit of work.
    ///
    /// Per-host failures end up in the outcome and are committed with the rest.
    /// Any error returned here means nothing was committed.
    #[instrument(
        skip(self, request),
        fields(owner = %request.owner_key, hosts = request.report.len(), create_missing = request.create_missing)
    )]
    pub async fn reconcile(&self, request: &ReconcileRequest) -> Result<ReconciliationOutcome> {
        let mut uow = self.store.begin().await?;

        match self.reconcile_in(uow.as_mut(), request).await {
            Ok(outcome) => {
                uow.commit().await?;
                info!(
                    created = outcome.created.as_ref().map_or(0, Vec::len),
                    updated = outcome.updated.len(),
                    failed_create = outcome.failed_create.len(),
                    failed_update = outcome.failed_update.len(),
                    "Hypervisor report reconciled"
                );
                Ok(outcome)
            }
            Err(e) => {
                error!(error = %e, "Hypervisor reconciliation failed, rolling back");
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn reconcile_in(
        &self,
        uow: &mut dyn UnitOfWork,
        request: &ReconcileRequest,
    ) -> Result<ReconciliationOutcome> {
        let owner = self
            .authorized_owner(uow, &request.owner_key, &request.principal)
            .await?;
        if owner.autobind_disabled {
            return Err(ReconcileError::AutobindDisabled {
                owner_key: owner.key.clone(),
            });
        }

        let entries = normalize(&request.report);
        debug!(
            reported = request.report.len(),
            normalized = entries.len(),
            "Normalized hypervisor report"
        );

        let hypervisor_ids: BTreeSet<String> =
            entries.iter().map(|e| e.hypervisor_id.clone()).collect();
        let system_uuids: BTreeSet<String> = entries
            .iter()
            .filter_map(HostEntry::system_uuid)
            .map(str::to_lowercase)
            .collect();
        let known = uow
            .host_consumers(&owner, &hypervisor_ids, &system_uuids)
            .await?;

        let guest_ids: BTreeSet<String> = entries
            .iter()
            .flat_map(|e| e.guest_ids.iter().map(|g| g.to_lowercase()))
            .collect();
        let guests = if guest_ids.is_empty() {
            GuestConsumerMap::default()
        } else {
            uow.guest_consumers(&owner, &guest_ids).await?
        };

        let create_denied = (request.create_missing
            && !self
                .authorizer
                .can_access(&request.principal, &owner, Access::Create))
        .then(|| {
            format!(
                "{} does not have permission to create consumers in owner {}",
                request.principal, owner.key
            )
        });

        let now = Utc::now();
        let planner = MutationPlanner::new(
            &owner,
            request.create_missing,
            request.reporter_id.as_deref(),
            self.ids.as_ref(),
            now,
        )
        .with_create_denied(create_denied);
        let mut matcher = IdentityMatcher::new(&known);

        let mutations: Vec<Mutation> = entries
            .iter()
            .map(|entry| planner.plan(entry, matcher.resolve(entry)))
            .collect();
        let migrations = guest_migrations(&mutations, &guests);

        let mut outcome = OutcomeBuilder::new(request.create_missing);
        BatchPersister::new(uow)
            .apply(mutations, &mut outcome)
            .await?;

        for (host_key, migration) in migrations {
            if outcome.succeeded(&host_key) {
                info!(
                    guest = %migration.guest_id,
                    guest_uuid = %migration.guest_uuid,
                    host_uuid = %migration.host_uuid,
                    "Guest now reported on a new host"
                );
                outcome.migrated(migration);
            }
        }

        Ok(outcome.finish())
    }

    /// Stamps a check-in on every hypervisor the reporter is responsible for.
    #[instrument(skip(self, principal), fields(owner = %owner_key, reporter = %reporter_id))]
    pub async fn heartbeat(
        &self,
        owner_key: &str,
        reporter_id: &str,
        principal: &Principal,
    ) -> Result<HeartbeatOutcome> {
        let mut uow = self.store.begin().await?;

        match self
            .heartbeat_in(uow.as_mut(), owner_key, reporter_id, principal, Utc::now())
            .await
        {
            Ok(updated) => {
                uow.commit().await?;
                info!(updated, "Hypervisor heartbeat recorded");
                Ok(HeartbeatOutcome {
                    owner_key: owner_key.to_string(),
                    reporter_id: reporter_id.to_string(),
                    updated,
                })
            }
            Err(e) => {
                error!(error = %e, "Hypervisor heartbeat failed, rolling back");
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn heartbeat_in(
        &self,
        uow: &mut dyn UnitOfWork,
        owner_key: &str,
        reporter_id: &str,
        principal: &Principal,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let owner = self.authorized_owner(uow, owner_key, principal).await?;
        let mut consumers = uow.consumers_by_reporter(&owner, reporter_id).await?;
        if consumers.is_empty() {
            return Ok(0);
        }
        for consumer in &mut consumers {
            consumer.last_checkin = Some(now);
        }
        uow.update_attributes(&consumers).await?;
        Ok(consumers.len())
    }

    async fn authorized_owner(
        &self,
        uow: &mut dyn UnitOfWork,
        owner_key: &str,
        principal: &Principal,
    ) -> Result<Owner> {
        let owner = uow
            .owner(owner_key)
            .await?
            .ok_or_else(|| ReconcileError::OwnerNotFound(owner_key.to_string()))?;
        if !self.authorizer.can_access(principal, &owner, Access::Update) {
            return Err(ReconcileError::AccessDenied {
                principal: principal.to_string(),
                owner_key: owner.key.clone(),
                required: Access::Update,
            });
        }
        Ok(owner)
    }
}

/// Guests newly added to a host that belong to a registered guest consumer.
fn guest_migrations(
    mutations: &[Mutation],
    guests: &GuestConsumerMap,
) -> Vec<(String, GuestMigration)> {
    let mut migrations = Vec::new();
    if guests.is_empty() {
        return migrations;
    }
    for mutation in mutations {
        let (host_key, host, added): (&String, &Consumer, Vec<&String>) = match mutation {
            Mutation::Create { host_key, consumer } => (
                host_key,
                consumer,
                consumer.guest_ids.iter().map(|g| &g.guest_id).collect(),
            ),
            Mutation::Update {
                host_key,
                consumer,
                changes,
            } => (host_key, consumer, changes.guests.additions.iter().collect()),
            _ => continue,
        };
        for guest_id in added {
            if let Some(guest) = guests.get(guest_id) {
                migrations.push((
                    host_key.clone(),
                    GuestMigration {
                        guest_id: guest_id.clone(),
                        guest_uuid: guest.uuid.clone(),
                        host_uuid: host.uuid.clone(),
                    },
                ));
            }
        }
    }
    migrations
}
