use crate::guests::{replace_guests, GuestDiff};
use crate::ids::IdGenerator;
use crate::matcher::{identity_override, MatchDecision};
use crate::normalize::HostEntry;
use chrono::{DateTime, Utc};
use hypervisor_common::{Consumer, GuestId, HypervisorId, Owner};

/// Which outcome list a per-host failure lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Create,
    Update,
}

/// What an update actually touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub identity: Option<HypervisorId>,
    pub facts: bool,
    pub guests: GuestDiff,
}

impl ChangeSet {
    pub fn guests_changed(&self) -> bool {
        !self.guests.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create {
        host_key: String,
        consumer: Consumer,
    },
    Update {
        host_key: String,
        consumer: Consumer,
        changes: ChangeSet,
    },
    /// Reserved for hosts that need no write at all; the persister ignores it.
    Skip { host_key: String },
    Failed {
        host_key: String,
        message: String,
        kind: FailureKind,
    },
}

impl Mutation {
    pub fn host_key(&self) -> &str {
        match self {
            Mutation::Create { host_key, .. }
            | Mutation::Update { host_key, .. }
            | Mutation::Skip { host_key }
            | Mutation::Failed { host_key, .. } => host_key,
        }
    }
}

/// Turns match decisions into concrete consumer writes for one run.
pub struct MutationPlanner<'a> {
    owner: &'a Owner,
    create_missing: bool,
    reporter_id: Option<&'a str>,
    ids: &'a dyn IdGenerator,
    now: DateTime<Utc>,
    create_denied: Option<String>,
}

impl<'a> MutationPlanner<'a> {
    pub fn new(
        owner: &'a Owner,
        create_missing: bool,
        reporter_id: Option<&'a str>,
        ids: &'a dyn IdGenerator,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            owner,
            create_missing,
            reporter_id,
            ids,
            now,
            create_denied: None,
        }
    }

    /// Every create planned after this fails with `cause`.
    pub fn with_create_denied(mut self, cause: Option<String>) -> Self {
        self.create_denied = cause;
        self
    }

    pub fn plan(&self, entry: &HostEntry, decision: MatchDecision) -> Mutation {
        match decision {
            MatchDecision::Existing(consumer) => self.plan_update(entry, consumer),
            MatchDecision::AlreadyClaimed { by } => Mutation::Failed {
                host_key: entry.host_key.clone(),
                message: format!(
                    "{}: Hypervisor already reported as \"{}\" in this report",
                    entry.host_key, by
                ),
                kind: FailureKind::Update,
            },
            MatchDecision::IdentityTaken { holder } => Mutation::Failed {
                host_key: entry.host_key.clone(),
                message: format!(
                    "{}: Hypervisor id \"{}\" is already used by consumer \"{}\"",
                    entry.host_key, entry.hypervisor_id, holder
                ),
                kind: FailureKind::Update,
            },
            MatchDecision::Missing if !self.create_missing => Mutation::Failed {
                host_key: entry.host_key.clone(),
                message: format!(
                    "{}: Unable to find hypervisor in org \"{}\"",
                    entry.host_key, self.owner.key
                ),
                kind: FailureKind::Update,
            },
            MatchDecision::Missing => self.plan_create(entry),
        }
    }

    fn plan_create(&self, entry: &HostEntry) -> Mutation {
        let built = match &self.create_denied {
            Some(cause) => Err(cause.clone()),
            None => Consumer::hypervisor(self.ids.generate(), &entry.name, &self.owner.key)
                .map_err(|e| e.to_string()),
        };

        match built {
            Ok(mut consumer) => {
                consumer.hypervisor_id = Some(HypervisorId::new(
                    &entry.hypervisor_id,
                    self.reporter_id.map(str::to_string),
                ));
                consumer.facts = entry.facts.clone().unwrap_or_default();
                consumer.guest_ids = entry.guest_ids.iter().map(GuestId::new).collect();
                consumer.last_checkin = Some(self.now);
                Mutation::Create {
                    host_key: entry.host_key.clone(),
                    consumer,
                }
            }
            Err(cause) => Mutation::Failed {
                host_key: entry.host_key.clone(),
                message: format!("Problem creating unit {}: {}", entry.name, cause),
                kind: FailureKind::Create,
            },
        }
    }

    fn plan_update(&self, entry: &HostEntry, mut consumer: Consumer) -> Mutation {
        let identity = identity_override(&consumer, entry, self.reporter_id);
        if let Some(id) = &identity {
            consumer.hypervisor_id = Some(id.clone());
        }

        let mut facts = false;
        if let Some(reported) = &entry.facts {
            if *reported != consumer.facts {
                consumer.facts = reported.clone();
                facts = true;
            }
        }

        let guests = replace_guests(&mut consumer, &entry.guest_ids);
        consumer.last_checkin = Some(self.now);

        Mutation::Update {
            host_key: entry.host_key.clone(),
            consumer,
            changes: ChangeSet {
                identity,
                facts,
                guests,
            },
        }
    }
}
