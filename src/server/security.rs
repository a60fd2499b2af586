//! Address permissions.
//!
//! Roles grant permission bits; role sets are attached to address patterns
//! and resolved through the same hierarchical repository as address settings,
//! except that the most specific matching set wins whole.

use crate::settings::repository::{HierarchicalRepository, Mergeable};
use crate::settings::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("user '{user}' lacks {check} permission on '{address}'")]
    NotAuthorized {
        user: String,
        address: String,
        check: CheckType,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    #[serde(default)]
    pub send: bool,
    #[serde(default)]
    pub consume: bool,
    #[serde(default)]
    pub create_durable_queue: bool,
    #[serde(default)]
    pub delete_durable_queue: bool,
    #[serde(default)]
    pub create_non_durable_queue: bool,
    #[serde(default)]
    pub delete_non_durable_queue: bool,
    #[serde(default)]
    pub manage: bool,
}

impl Role {
    #[allow(clippy::fn_params_excessive_bools)]
    pub fn new(
        name: impl Into<String>,
        send: bool,
        consume: bool,
        create_durable_queue: bool,
        delete_durable_queue: bool,
        create_non_durable_queue: bool,
        delete_non_durable_queue: bool,
        manage: bool,
    ) -> Self {
        Self {
            name: name.into(),
            send,
            consume,
            create_durable_queue,
            delete_durable_queue,
            create_non_durable_queue,
            delete_non_durable_queue,
            manage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckType {
    Send,
    Consume,
    CreateDurableQueue,
    DeleteDurableQueue,
    CreateNonDurableQueue,
    DeleteNonDurableQueue,
    Manage,
}

impl CheckType {
    pub fn has_role(self, role: &Role) -> bool {
        match self {
            CheckType::Send => role.send,
            CheckType::Consume => role.consume,
            CheckType::CreateDurableQueue => role.create_durable_queue,
            CheckType::DeleteDurableQueue => role.delete_durable_queue,
            CheckType::CreateNonDurableQueue => role.create_non_durable_queue,
            CheckType::DeleteNonDurableQueue => role.delete_non_durable_queue,
            CheckType::Manage => role.manage,
        }
    }

    pub fn create_queue(durable: bool) -> Self {
        if durable {
            CheckType::CreateDurableQueue
        } else {
            CheckType::CreateNonDurableQueue
        }
    }

    pub fn delete_queue(durable: bool) -> Self {
        if durable {
            CheckType::DeleteDurableQueue
        } else {
            CheckType::DeleteNonDurableQueue
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckType::Send => "SEND",
            CheckType::Consume => "CONSUME",
            CheckType::CreateDurableQueue => "CREATE_DURABLE_QUEUE",
            CheckType::DeleteDurableQueue => "DELETE_DURABLE_QUEUE",
            CheckType::CreateNonDurableQueue => "CREATE_NON_DURABLE_QUEUE",
            CheckType::DeleteNonDurableQueue => "DELETE_NON_DURABLE_QUEUE",
            CheckType::Manage => "MANAGE",
        };
        f.write_str(name)
    }
}

/// Roles attached to one address pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleSet(pub Vec<Role>);

impl Mergeable for RoleSet {
    // The most specific set replaces less specific ones entirely.
    fn merge(&mut self, _less_specific: &Self) {}
}

/// Answers whether a user may perform `check` on `address`.
pub trait SecurityManager: Send + Sync {
    fn validate(&self, user: Option<&str>, address: &str, check: CheckType) -> bool;

    fn check(
        &self,
        user: Option<&str>,
        address: &str,
        check: CheckType,
    ) -> Result<(), SecurityError> {
        if self.validate(user, address, check) {
            Ok(())
        } else {
            Err(SecurityError::NotAuthorized {
                user: user.unwrap_or("<anonymous>").to_string(),
                address: address.to_string(),
                check,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl SecurityManager for AllowAll {
    fn validate(&self, _user: Option<&str>, _address: &str, _check: CheckType) -> bool {
        true
    }
}

/// Role-based permissions: users map to role names, address patterns map to
/// role definitions.
pub struct RoleBasedSecurity {
    roles: HierarchicalRepository<RoleSet>,
    users: HashMap<String, HashSet<String>>,
}

impl RoleBasedSecurity {
    pub fn new() -> Self {
        Self {
            roles: HierarchicalRepository::new(RoleSet::default()),
            users: HashMap::new(),
        }
    }

    pub fn add_roles(&self, pattern: &str, roles: Vec<Role>) -> Result<(), ConfigError> {
        self.roles.add_match(pattern, RoleSet(roles))
    }

    pub fn with_user(
        mut self,
        user: impl Into<String>,
        roles: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.users
            .insert(user.into(), roles.into_iter().map(Into::into).collect());
        self
    }

    pub fn roles_for(&self, address: &str) -> RoleSet {
        (*self.roles.get_match(address)).clone()
    }
}

impl Default for RoleBasedSecurity {
    fn default() -> Self {
        Self::new()
    }
}

impl SecurityManager for RoleBasedSecurity {
    fn validate(&self, user: Option<&str>, address: &str, check: CheckType) -> bool {
        let Some(granted) = user.and_then(|u| self.users.get(u)) else {
            debug!(address, %check, "no roles for anonymous or unknown user");
            return false;
        };
        let roles = self.roles.get_match(address);
        roles
            .0
            .iter()
            .any(|role| granted.contains(&role.name) && check.has_role(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_only_role() {
        let role = Role::new("reader", true, false, false, false, false, false, false);
        assert!(CheckType::Send.has_role(&role));
        assert!(!CheckType::Consume.has_role(&role));
        assert!(!CheckType::CreateDurableQueue.has_role(&role));
        assert!(!CheckType::DeleteNonDurableQueue.has_role(&role));
    }

    #[test]
    fn test_create_durable_role() {
        let role = Role::new("creator", false, false, true, false, false, false, false);
        assert!(CheckType::create_queue(true).has_role(&role));
        assert!(!CheckType::create_queue(false).has_role(&role));
        assert!(!CheckType::Send.has_role(&role));
    }

    #[test]
    fn test_role_equality_covers_every_field() {
        let role = Role::new("r", true, true, true, false, false, false, false);
        assert_eq!(role, Role::new("r", true, true, true, false, false, false, false));
        assert_ne!(role, Role::new("other", true, true, true, false, false, false, false));
        assert_ne!(role, Role::new("r", false, true, true, false, false, false, false));
        assert_ne!(role, Role::new("r", true, true, false, false, false, false, false));
    }

    #[test]
    fn test_most_specific_role_set_wins() {
        let security = RoleBasedSecurity::new().with_user("alice", ["producer"]);
        security
            .add_roles(
                "#",
                vec![Role::new("producer", true, true, false, false, false, false, false)],
            )
            .unwrap();
        security
            .add_roles(
                "secret.*",
                vec![Role::new("admin", true, true, true, true, true, true, true)],
            )
            .unwrap();
        assert!(security.validate(Some("alice"), "orders", CheckType::Send));
        assert!(!security.validate(Some("alice"), "secret.plans", CheckType::Send));
        assert!(!security.validate(None, "orders", CheckType::Send));
        assert!(matches!(
            security.check(Some("bob"), "orders", CheckType::Consume),
            Err(SecurityError::NotAuthorized { .. })
        ));
    }
}
