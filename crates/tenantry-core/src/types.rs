//! Shared types used across Tenantry crates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of the proxy group that grants platform-wide administration.
pub const GLOBAL_ADMIN_GROUP: &str = "admin";

/// Role of a principal inside one tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    #[default]
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// The authenticated principal behind a request, as asserted by the
/// fronting proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub principal: String,
    pub groups: Vec<String>,
}

impl Caller {
    pub fn new(principal: impl Into<String>) -> Self {
        Self {
            principal: principal.into(),
            groups: Vec::new(),
        }
    }

    /// Build a caller from the raw comma-separated groups header.
    pub fn with_groups_header(principal: impl Into<String>, groups: &str) -> Self {
        Self {
            principal: principal.into(),
            groups: groups
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_global_admin(&self) -> bool {
        self.groups.iter().any(|g| g == GLOBAL_ADMIN_GROUP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn groups_header_parsing() {
        let caller = Caller::with_groups_header("alice", " dev , admin,,");
        assert_eq!(caller.groups, vec!["dev", "admin"]);
        assert!(caller.is_global_admin());

        let caller = Caller::with_groups_header("bob", "administrators");
        assert!(!caller.is_global_admin());
    }

    #[test]
    fn role_round_trips_through_str() {
        assert_eq!("admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(Role::Member.to_string(), "member");
        assert!("owner".parse::<Role>().is_err());
    }
}
