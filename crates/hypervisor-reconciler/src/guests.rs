use hypervisor_common::{Consumer, GuestId};
use std::collections::HashMap;

/// Difference between a host's stored guest list and the freshly reported one.
///
/// Comparison ignores case and order. The reported list is authoritative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestDiff {
    pub additions: Vec<String>,
    pub removals: Vec<String>,
    /// Present on both sides under a different spelling; carries the reported spelling.
    pub respelled: Vec<String>,
}

impl GuestDiff {
    pub fn between(current: &[GuestId], reported: &[String]) -> Self {
        let stored: HashMap<String, &str> = current
            .iter()
            .map(|g| (g.guest_id.to_lowercase(), g.guest_id.as_str()))
            .collect();
        let incoming: HashMap<String, &str> = reported
            .iter()
            .map(|g| (g.to_lowercase(), g.as_str()))
            .collect();

        let mut diff = GuestDiff::default();
        for guest in reported {
            match stored.get(&guest.to_lowercase()) {
                None => diff.additions.push(guest.clone()),
                Some(spelling) if *spelling != guest => diff.respelled.push(guest.clone()),
                Some(_) => {}
            }
        }
        for guest in current {
            if !incoming.contains_key(&guest.guest_id.to_lowercase()) {
                diff.removals.push(guest.guest_id.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty()
            && self.removals.is_empty()
            && self.respelled.is_empty()
    }
}

/// Makes `consumer`'s guest list exactly `reported`. Returns what changed.
pub fn replace_guests(consumer: &mut Consumer, reported: &[String]) -> GuestDiff {
    let diff = GuestDiff::between(&consumer.guest_ids, reported);
    if !diff.is_empty() {
        consumer.guest_ids = reported.iter().map(GuestId::new).collect();
    }
    diff
}
