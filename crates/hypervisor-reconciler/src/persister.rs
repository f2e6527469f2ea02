use crate::outcome::OutcomeBuilder;
use crate::planner::{FailureKind, Mutation};
use crate::storage::UnitOfWork;
use crate::StoreResult;
use hypervisor_common::Consumer;
use tracing::{debug, warn};

/// Writes planned mutations through one unit of work.
///
/// Creates go one at a time so a rejected host only fails itself. Updates are
/// collected and written in at most two bulk calls; a failing bulk call is
/// returned to the caller and fails the whole run.
pub struct BatchPersister<'a> {
    uow: &'a mut dyn UnitOfWork,
}

impl<'a> BatchPersister<'a> {
    pub fn new(uow: &'a mut dyn UnitOfWork) -> Self {
        Self { uow }
    }

    pub async fn apply(
        self,
        mutations: Vec<Mutation>,
        outcome: &mut OutcomeBuilder,
    ) -> StoreResult<()> {
        let mut attribute_batch: Vec<Consumer> = Vec::new();
        let mut membership_batch: Vec<Consumer> = Vec::new();

        for mutation in mutations {
            match mutation {
                Mutation::Create { host_key, consumer } => {
                    let name = consumer.name.clone();
                    match self.uow.create(consumer).await {
                        Ok(created) => {
                            debug!(host = %host_key, uuid = %created.uuid, "Created hypervisor consumer");
                            outcome.created(&host_key, &created);
                        }
                        Err(e) => {
                            warn!(host = %host_key, error = %e, "Failed to create hypervisor consumer");
                            outcome.failed(
                                FailureKind::Create,
                                &host_key,
                                format!("Problem creating unit {name}: {e}"),
                            );
                        }
                    }
                }
                Mutation::Update {
                    host_key,
                    consumer,
                    changes,
                } => {
                    outcome.updated(&host_key, &consumer);
                    if changes.guests_changed() {
                        membership_batch.push(consumer);
                    } else {
                        attribute_batch.push(consumer);
                    }
                }
                Mutation::Skip { host_key } => {
                    debug!(host = %host_key, "Nothing to write for host");
                }
                Mutation::Failed {
                    host_key,
                    message,
                    kind,
                } => {
                    warn!(host = %host_key, %message, "Host could not be reconciled");
                    outcome.failed(kind, &host_key, message);
                }
            }
        }

        if !attribute_batch.is_empty() {
            debug!(count = attribute_batch.len(), "Writing attribute updates");
            self.uow.update_attributes(&attribute_batch).await?;
        }
        if !membership_batch.is_empty() {
            debug!(count = membership_batch.len(), "Writing guest membership updates");
            self.uow.update_guest_memberships(&membership_batch).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::ChangeSet;
    use crate::storage::{ConsumerStore, InMemoryStore};
    use crate::GuestDiff;
    use hypervisor_common::HypervisorId;

    fn host(uuid: &str) -> Consumer {
        Consumer::hypervisor(uuid, uuid, "admin")
            .unwrap()
            .with_hypervisor_id(HypervisorId::new(uuid, None))
    }

    fn update(consumer: Consumer, guests_changed: bool) -> Mutation {
        let guests = GuestDiff {
            additions: if guests_changed {
                vec!["g".to_string()]
            } else {
                Vec::new()
            },
            ..Default::default()
        };
        Mutation::Update {
            host_key: consumer.uuid.clone(),
            consumer,
            changes: ChangeSet {
                guests,
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn test_rejected_create_does_not_stop_batch() {
        let store = InMemoryStore::new();
        store.reject_create("bad", "Forced Exception.").await;
        let mut uow = store.begin().await.unwrap();
        let mut outcome = OutcomeBuilder::new(true);

        let mutations = vec![
            Mutation::Create {
                host_key: "bad".to_string(),
                consumer: host("bad"),
            },
            Mutation::Create {
                host_key: "good".to_string(),
                consumer: host("good"),
            },
        ];
        BatchPersister::new(uow.as_mut())
            .apply(mutations, &mut outcome)
            .await
            .unwrap();
        uow.commit().await.unwrap();

        let outcome = outcome.finish();
        assert_eq!(outcome.created.unwrap().len(), 1);
        assert_eq!(
            outcome.failed_create,
            vec!["Problem creating unit bad: Forced Exception.".to_string()]
        );
        assert!(store.consumer("good").await.is_some());
    }

    #[tokio::test]
    async fn test_updates_split_into_two_batches() {
        let store = InMemoryStore::new();
        let a = store.insert_consumer(host("a")).await;
        let b = store.insert_consumer(host("b")).await;
        let mut uow = store.begin().await.unwrap();
        let mut outcome = OutcomeBuilder::new(true);

        BatchPersister::new(uow.as_mut())
            .apply(vec![update(a, false), update(b, true)], &mut outcome)
            .await
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.attribute_updates, 1);
        assert_eq!(stats.membership_updates, 1);
        assert_eq!(outcome.finish().updated.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_batches_are_skipped() {
        let store = InMemoryStore::new();
        let a = store.insert_consumer(host("a")).await;
        let mut uow = store.begin().await.unwrap();
        let mut outcome = OutcomeBuilder::new(true);

        BatchPersister::new(uow.as_mut())
            .apply(
                vec![
                    update(a, false),
                    Mutation::Skip {
                        host_key: "x".to_string(),
                    },
                ],
                &mut outcome,
            )
            .await
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.attribute_updates, 1);
        assert_eq!(stats.membership_updates, 0);
    }

    #[tokio::test]
    async fn test_bulk_failure_is_returned() {
        let store = InMemoryStore::new();
        let a = store.insert_consumer(host("a")).await;
        store.fail_bulk_updates("database unavailable").await;
        let mut uow = store.begin().await.unwrap();
        let mut outcome = OutcomeBuilder::new(true);

        let err = BatchPersister::new(uow.as_mut())
            .apply(vec![update(a, true)], &mut outcome)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Storage error: database unavailable");
    }
}
