use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw hypervisor check-in payload, as submitted by a reporter such as virt-who.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HypervisorReport {
    #[serde(default)]
    pub hypervisors: Vec<ReportedHypervisor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedHypervisor {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hypervisor_id: Option<ReportedHypervisorId>,
    #[serde(default)]
    pub guest_ids: Option<Vec<Option<ReportedGuestId>>>,
    #[serde(default)]
    pub facts: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedHypervisorId {
    #[serde(default)]
    pub hypervisor_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedGuestId {
    #[serde(default)]
    pub guest_id: Option<String>,
}

impl HypervisorReport {
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }

    /// Builds a report from the older `host id -> guest ids` mapping, where the
    /// host id doubles as the consumer name.
    pub fn from_host_guest_map<I>(mapping: I) -> Self
    where
        I: IntoIterator<Item = (String, Option<Vec<String>>)>,
    {
        let hypervisors = mapping
            .into_iter()
            .map(|(host, guests)| ReportedHypervisor {
                name: Some(host.clone()),
                hypervisor_id: Some(ReportedHypervisorId {
                    hypervisor_id: Some(host),
                }),
                guest_ids: guests.map(|ids| {
                    ids.into_iter()
                        .map(|id| Some(ReportedGuestId { guest_id: Some(id) }))
                        .collect()
                }),
                facts: None,
            })
            .collect();
        Self { hypervisors }
    }

    pub fn with_hypervisor(mut self, hypervisor: ReportedHypervisor) -> Self {
        self.hypervisors.push(hypervisor);
        self
    }

    pub fn len(&self) -> usize {
        self.hypervisors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hypervisors.is_empty()
    }
}

impl ReportedHypervisor {
    pub fn new(hypervisor_id: impl Into<String>) -> Self {
        Self {
            hypervisor_id: Some(ReportedHypervisorId {
                hypervisor_id: Some(hypervisor_id.into()),
            }),
            guest_ids: Some(Vec::new()),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_guests<I, S>(mut self, guests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.guest_ids = Some(
            guests
                .into_iter()
                .map(|g| {
                    Some(ReportedGuestId {
                        guest_id: Some(g.into()),
                    })
                })
                .collect(),
        );
        self
    }

    pub fn without_guest_list(mut self) -> Self {
        self.guest_ids = None;
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.facts
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn raw_hypervisor_id(&self) -> Option<&str> {
        self.hypervisor_id
            .as_ref()
            .and_then(|h| h.hypervisor_id.as_deref())
    }
}
