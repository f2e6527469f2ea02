use crate::normalize::HostEntry;
use crate::storage::HostConsumerMap;
use hypervisor_common::{Consumer, HypervisorId};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Existing(Consumer),
    Missing,
    /// An earlier entry of the same report already matched this consumer.
    AlreadyClaimed { by: String },
    /// Matched by system uuid, but the reported hypervisor id belongs to
    /// another consumer (`holder` is its uuid).
    IdentityTaken { holder: String },
}

/// Resolves host entries against the consumers loaded for the run.
///
/// A reported `dmi.system.uuid` fact wins over the hypervisor id, so a host
/// that changed its id is still recognised. Such a host is not moved onto an
/// id another consumer of the owner still holds.
pub struct IdentityMatcher<'a> {
    known: &'a HostConsumerMap,
    claimed: HashMap<String, String>,
}

impl<'a> IdentityMatcher<'a> {
    pub fn new(known: &'a HostConsumerMap) -> Self {
        Self {
            known,
            claimed: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, entry: &HostEntry) -> MatchDecision {
        let known = self.known;
        let by_id = known.by_hypervisor_id(&entry.hypervisor_id);
        let found = entry
            .system_uuid()
            .and_then(|uuid| known.by_system_uuid(uuid))
            .or(by_id);

        let Some(consumer) = found else {
            return MatchDecision::Missing;
        };

        if let Some(by) = self.claimed.get(&consumer.uuid) {
            return MatchDecision::AlreadyClaimed { by: by.clone() };
        }
        if let Some(holder) = by_id.filter(|holder| holder.uuid != consumer.uuid) {
            return MatchDecision::IdentityTaken {
                holder: holder.uuid.clone(),
            };
        }
        self.claimed
            .insert(consumer.uuid.clone(), entry.host_key.clone());
        MatchDecision::Existing(consumer.clone())
    }
}

/// The identity `existing` should carry after this report, or `None` if it is unchanged.
///
/// Last report wins: a different hypervisor id replaces the stored one, and a
/// reporter id supplied with the run replaces the stored reporter.
pub fn identity_override(
    existing: &Consumer,
    entry: &HostEntry,
    reporter_id: Option<&str>,
) -> Option<HypervisorId> {
    let stored = existing.hypervisor_id.as_ref();
    let id_changed = stored.map_or(true, |h| h.hypervisor_id != entry.hypervisor_id);
    let reporter_changed =
        reporter_id.is_some_and(|r| stored.and_then(|h| h.reporter_id.as_deref()) != Some(r));

    if !id_changed && !reporter_changed {
        return None;
    }

    let reporter = reporter_id
        .map(str::to_string)
        .or_else(|| stored.and_then(|h| h.reporter_id.clone()));
    Some(HypervisorId::new(&entry.hypervisor_id, reporter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::report::{HypervisorReport, ReportedHypervisor};
    use hypervisor_common::facts;

    fn entry(host: ReportedHypervisor) -> HostEntry {
        normalize(&HypervisorReport::default().with_hypervisor(host)).remove(0)
    }

    fn known(consumers: Vec<Consumer>) -> HostConsumerMap {
        let mut map = HostConsumerMap::new();
        for consumer in consumers {
            map.insert(consumer);
        }
        map
    }

    fn host(uuid: &str, hypervisor_id: &str) -> Consumer {
        Consumer::hypervisor(uuid, uuid, "admin")
            .unwrap()
            .with_hypervisor_id(HypervisorId::new(hypervisor_id, None))
    }

    #[test]
    fn test_matches_hypervisor_id_ignoring_case() {
        let map = known(vec![host("c1", "uuid_999")]);
        let mut matcher = IdentityMatcher::new(&map);
        match matcher.resolve(&entry(ReportedHypervisor::new("UUID_999"))) {
            MatchDecision::Existing(c) => assert_eq!(c.uuid, "c1"),
            other => panic!("unexpected decision {other:?}"),
        }
        assert_eq!(
            matcher.resolve(&entry(ReportedHypervisor::new("other"))),
            MatchDecision::Missing
        );
    }

    #[test]
    fn test_system_uuid_takes_precedence() {
        let map = known(vec![
            host("by-fact", "existing_hypervisor_id").with_fact(facts::SYSTEM_UUID, "myUuid"),
            host("unrelated", "other_id"),
        ]);
        let mut matcher = IdentityMatcher::new(&map);
        let reported = entry(
            ReportedHypervisor::new("expectedHypervisorId").with_fact(facts::SYSTEM_UUID, "MYUUID"),
        );
        match matcher.resolve(&reported) {
            MatchDecision::Existing(c) => assert_eq!(c.uuid, "by-fact"),
            other => panic!("unexpected decision {other:?}"),
        }
    }

    #[test]
    fn test_system_uuid_match_cannot_take_held_id() {
        let map = known(vec![
            host("x", "a").with_fact(facts::SYSTEM_UUID, "S"),
            host("y", "b"),
        ]);
        let mut matcher = IdentityMatcher::new(&map);
        let reported = entry(ReportedHypervisor::new("b").with_fact(facts::SYSTEM_UUID, "S"));
        assert_eq!(
            matcher.resolve(&reported),
            MatchDecision::IdentityTaken {
                holder: "y".to_string()
            }
        );

        // Both sides agreeing on one consumer is not a conflict.
        let mut matcher = IdentityMatcher::new(&map);
        let same = entry(ReportedHypervisor::new("a").with_fact(facts::SYSTEM_UUID, "s"));
        assert!(matches!(matcher.resolve(&same), MatchDecision::Existing(ref c) if c.uuid == "x"));
    }

    #[test]
    fn test_second_claim_is_reported() {
        let map = known(vec![host("c1", "old-id").with_fact(facts::SYSTEM_UUID, "sys")]);
        let mut matcher = IdentityMatcher::new(&map);
        let first = entry(ReportedHypervisor::new("old-id"));
        let second = entry(ReportedHypervisor::new("new-id").with_fact(facts::SYSTEM_UUID, "sys"));

        assert!(matches!(matcher.resolve(&first), MatchDecision::Existing(_)));
        assert_eq!(
            matcher.resolve(&second),
            MatchDecision::AlreadyClaimed {
                by: "old-id".to_string()
            }
        );
    }

    #[test]
    fn test_identity_override() {
        let existing = host("c1", "existing_hypervisor_id");
        let reported = entry(ReportedHypervisor::new("expectedHypervisorId"));
        let id = identity_override(&existing, &reported, None).unwrap();
        assert_eq!(id.hypervisor_id, "expectedhypervisorid");
        assert_eq!(id.reporter_id, None);

        let same = entry(ReportedHypervisor::new("EXISTING_HYPERVISOR_ID"));
        assert_eq!(identity_override(&existing, &same, None), None);

        let id = identity_override(&existing, &same, Some("virt-who")).unwrap();
        assert_eq!(id.hypervisor_id, "existing_hypervisor_id");
        assert_eq!(id.reporter_id.as_deref(), Some("virt-who"));
    }

    #[test]
    fn test_reporter_kept_when_run_has_none() {
        let existing = Consumer::hypervisor("c1", "c1", "admin")
            .unwrap()
            .with_hypervisor_id(HypervisorId::new("old", Some("virt-who".to_string())));
        let id = identity_override(&existing, &entry(ReportedHypervisor::new("new")), None).unwrap();
        assert_eq!(id.reporter_id.as_deref(), Some("virt-who"));

        let unchanged = entry(ReportedHypervisor::new("old"));
        assert_eq!(identity_override(&existing, &unchanged, Some("virt-who")), None);
    }
}
