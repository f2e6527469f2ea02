use crate::report::{HypervisorReport, ReportedGuestId};
use hypervisor_common::{canonical_hypervisor_id, facts};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One cleaned-up host from a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    /// Trimmed host id as reported; used in failure messages.
    pub host_key: String,
    /// Lower-cased host id used for matching.
    pub hypervisor_id: String,
    pub name: String,
    pub guest_ids: Vec<String>,
    pub facts: Option<BTreeMap<String, String>>,
}

impl HostEntry {
    pub fn system_uuid(&self) -> Option<&str> {
        self.facts
            .as_ref()
            .and_then(|f| f.get(facts::SYSTEM_UUID))
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }
}

/// Turns a raw report into host entries, in report order.
///
/// Hosts without a usable id are dropped silently, as are blank guest ids.
/// A host (or a guest within a host) listed twice keeps the position of its
/// first appearance and the content of its last.
pub fn normalize(report: &HypervisorReport) -> Vec<HostEntry> {
    let mut entries: Vec<HostEntry> = Vec::with_capacity(report.hypervisors.len());
    let mut positions: HashMap<String, usize> = HashMap::new();

    for reported in &report.hypervisors {
        let Some(host_key) = reported
            .raw_hypervisor_id()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            debug!(name = ?reported.name, "Dropping hypervisor without an id");
            continue;
        };

        let name = reported
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(host_key);

        let entry = HostEntry {
            host_key: host_key.to_string(),
            hypervisor_id: canonical_hypervisor_id(host_key),
            name: name.to_string(),
            guest_ids: normalize_guests(reported.guest_ids.as_deref()),
            facts: reported.facts.clone(),
        };

        match positions.get(&entry.hypervisor_id) {
            Some(&index) => {
                debug!(host = %entry.host_key, "Hypervisor listed twice, keeping the last entry");
                entries[index] = entry;
            }
            None => {
                positions.insert(entry.hypervisor_id.clone(), entries.len());
                entries.push(entry);
            }
        }
    }

    entries
}

fn normalize_guests(guests: Option<&[Option<ReportedGuestId>]>) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for guest_id in guests
        .unwrap_or_default()
        .iter()
        .flatten()
        .filter_map(|g| g.guest_id.as_deref())
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        let key = guest_id.to_lowercase();
        match positions.get(&key) {
            Some(&index) => ids[index] = guest_id.to_string(),
            None => {
                positions.insert(key, ids.len());
                ids.push(guest_id.to_string());
            }
        }
    }

    ids
}
