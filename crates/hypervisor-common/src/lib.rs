// Re-export dependencies used in public interfaces of common types

use std::collections::BTreeMap;
use std::fmt::Display;

use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

/// Longest consumer name the store accepts.
pub const MAX_CONSUMER_NAME_LENGTH: usize = 255;

/// Commonly used/recognized consumer facts
pub mod facts {
    pub const SYSTEM_UUID: &str = "dmi.system.uuid";
    pub const VIRT_UUID: &str = "virt.uuid";
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("Consumer name must not be blank")]
    BlankName,

    #[error("Name of the consumer should be shorter than {max} characters.")]
    NameTooLong { max: usize },

    #[error("Unknown access level: {0}")]
    UnknownAccess(String),
}

pub type Result<T> = std::result::Result<T, ModelError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    System,
    Hypervisor,
}

impl ConsumerType {
    pub fn label(&self) -> &'static str {
        match self {
            ConsumerType::System => "system",
            ConsumerType::Hypervisor => "hypervisor",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Owner {
    pub key: String,
    pub display_name: String,
    #[serde(default)]
    pub autobind_disabled: bool,
}

impl Owner {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            display_name: key.clone(),
            key,
            autobind_disabled: false,
        }
    }

    pub fn with_autobind_disabled(mut self, disabled: bool) -> Self {
        self.autobind_disabled = disabled;
        self
    }
}

/// Lower-cases a reported hypervisor id into the form used for matching and storage.
pub fn canonical_hypervisor_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// The identity a host reports itself by. `hypervisor_id` is always stored lower-case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HypervisorId {
    pub hypervisor_id: String,
    pub reporter_id: Option<String>,
}

impl HypervisorId {
    pub fn new(hypervisor_id: &str, reporter_id: Option<String>) -> Self {
        Self {
            hypervisor_id: canonical_hypervisor_id(hypervisor_id),
            reporter_id,
        }
    }

    pub fn matches(&self, raw: &str) -> bool {
        self.hypervisor_id == canonical_hypervisor_id(raw)
    }
}

/// One guest VM listed under a host. Spelling is preserved, comparison ignores case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuestId {
    pub guest_id: String,
}

impl GuestId {
    pub fn new(guest_id: impl Into<String>) -> Self {
        Self {
            guest_id: guest_id.into(),
        }
    }

    pub fn matches(&self, other: &str) -> bool {
        self.guest_id.to_lowercase() == other.to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consumer {
    /// Assigned by the store when the consumer is first persisted.
    pub id: Option<String>,
    pub uuid: String,
    pub name: String,
    pub owner_key: String,
    pub consumer_type: ConsumerType,
    pub hypervisor_id: Option<HypervisorId>,
    #[serde(default)]
    pub guest_ids: Vec<GuestId>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    pub last_checkin: Option<DateTime<Utc>>,
}

impl Consumer {
    pub fn hypervisor(
        uuid: impl Into<String>,
        name: impl Into<String>,
        owner_key: impl Into<String>,
    ) -> Result<Self> {
        Self::build(uuid.into(), name.into(), owner_key.into(), ConsumerType::Hypervisor)
    }

    pub fn system(
        uuid: impl Into<String>,
        name: impl Into<String>,
        owner_key: impl Into<String>,
    ) -> Result<Self> {
        Self::build(uuid.into(), name.into(), owner_key.into(), ConsumerType::System)
    }

    fn build(uuid: String, name: String, owner_key: String, consumer_type: ConsumerType) -> Result<Self> {
        validate_name(&name)?;
        Ok(Self {
            id: None,
            uuid,
            name,
            owner_key,
            consumer_type,
            hypervisor_id: None,
            guest_ids: Vec::new(),
            facts: BTreeMap::new(),
            last_checkin: None,
        })
    }

    pub fn with_hypervisor_id(mut self, hypervisor_id: HypervisorId) -> Self {
        self.hypervisor_id = Some(hypervisor_id);
        self
    }

    pub fn with_guest(mut self, guest_id: impl Into<String>) -> Self {
        self.guest_ids.push(GuestId::new(guest_id));
        self
    }

    pub fn with_fact(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_fact(key, value);
        self
    }

    pub fn is_hypervisor(&self) -> bool {
        self.consumer_type == ConsumerType::Hypervisor
    }

    pub fn fact(&self, key: &str) -> Option<&str> {
        self.facts.get(key).map(String::as_str)
    }

    pub fn set_fact(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.facts.insert(key.into(), value.into());
    }

    pub fn system_uuid(&self) -> Option<&str> {
        self.fact(facts::SYSTEM_UUID)
    }

    pub fn has_guest(&self, guest_id: &str) -> bool {
        self.guest_ids.iter().any(|g| g.matches(guest_id))
    }

    pub fn guest_id_strings(&self) -> Vec<&str> {
        self.guest_ids.iter().map(|g| g.guest_id.as_str()).collect()
    }

    pub fn reporter_id(&self) -> Option<&str> {
        self.hypervisor_id
            .as_ref()
            .and_then(|h| h.reporter_id.as_deref())
    }
}

impl Display for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Consumer(uuid: {}, name: {}, type: {}, owner: {})",
            self.uuid,
            self.name,
            self.consumer_type.label(),
            self.owner_key
        )
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ModelError::BlankName);
    }
    if name.chars().count() > MAX_CONSUMER_NAME_LENGTH {
        return Err(ModelError::NameTooLong {
            max: MAX_CONSUMER_NAME_LENGTH,
        });
    }
    Ok(())
}

/// Access levels a principal can hold on an owner. A higher level implies the lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    Read,
    Update,
    Create,
}

impl std::str::FromStr for Access {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Access::Read),
            "update" => Ok(Access::Update),
            "create" => Ok(Access::Create),
            _ => Err(ModelError::UnknownAccess(s.to_string())),
        }
    }
}

/// Whoever submitted the report.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub username: String,
    #[serde(default)]
    pub super_admin: bool,
    #[serde(default)]
    pub grants: BTreeMap<String, Access>,
}

impl Principal {
    pub fn user(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn admin(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            super_admin: true,
            grants: BTreeMap::new(),
        }
    }

    pub fn with_grant(mut self, owner_key: impl Into<String>, access: Access) -> Self {
        self.grants.insert(owner_key.into(), access);
        self
    }

    pub fn access_to(&self, owner_key: &str) -> Option<Access> {
        if self.super_admin {
            return Some(Access::Create);
        }
        self.grants.get(owner_key).copied()
    }
}

impl Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.super_admin {
            write!(f, "Principal(admin: {})", self.username)
        } else {
            write!(f, "Principal(user: {})", self.username)
        }
    }
}
