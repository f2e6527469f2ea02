use hypervisor_common::{Access, Owner, Principal};

/// Decides whether a principal may act on an owner.
pub trait Authorizer: Send + Sync {
    fn can_access(&self, principal: &Principal, owner: &Owner, required: Access) -> bool;
}

/// Grants access from the principal's own grant table.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrincipalAuthorizer;

impl Authorizer for PrincipalAuthorizer {
    fn can_access(&self, principal: &Principal, owner: &Owner, required: Access) -> bool {
        principal
            .access_to(&owner.key)
            .is_some_and(|held| held >= required)
    }
}
