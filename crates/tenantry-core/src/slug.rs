//! Tenant slug validation and the resource names derived from a slug.
//!
//! A slug is the immutable identity of a tenant. Every other name the
//! control plane touches (database, replication slots, containers) is
//! derived from it, so a `TenantSlug` is only ever built through
//! [`TenantSlug::parse`].

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Postgres truncates identifiers longer than this many bytes.
pub const PG_IDENTIFIER_LIMIT: usize = 63;

const DATABASE_PREFIX: &str = "_supabase_";
const MESSAGES_SLOT_PREFIX: &str = "supabase_realtime_messages_replication_slot_";
const REPLICATION_SLOT_PREFIX: &str = "supabase_realtime_replication_slot_";

static SLUG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]{2,39}$").expect("static slug regex"));

const RESERVED_WORDS: &[&str] = &[
    "select", "from", "where", "insert", "update", "delete", "table", "create", "drop", "join",
    "group", "order", "limit", "into", "index", "view", "trigger", "procedure", "function",
    "database", "schema", "primary", "foreign", "key", "constraint", "unique", "null", "not",
    "and", "or", "in", "like", "between", "exists", "having", "union", "inner", "left", "right",
    "outer", "cross", "on", "as", "case", "when", "then", "else", "end", "if", "while", "for",
    "begin", "commit", "rollback",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlugError {
    #[error(
        "invalid tenant name {0:?}: use lowercase letters, digits or '_' \
         (3-40 characters, starting with a letter or '_')"
    )]
    Malformed(String),
    #[error("invalid tenant name {0:?}: reserved SQL keyword")]
    Reserved(String),
}

/// A validated tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantSlug(String);

impl TenantSlug {
    /// Trim, lowercase and validate a raw tenant name.
    pub fn parse(raw: &str) -> Result<Self, SlugError> {
        let name = raw.trim().to_lowercase();
        if !SLUG_RE.is_match(&name) {
            return Err(SlugError::Malformed(name));
        }
        if RESERVED_WORDS.contains(&name.as_str()) {
            return Err(SlugError::Reserved(name));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the tenant's dedicated database.
    pub fn database_name(&self) -> String {
        truncate_identifier(format!("{DATABASE_PREFIX}{}", self.0))
    }

    /// Realtime "messages" replication slot.
    pub fn messages_slot(&self) -> String {
        truncate_identifier(format!("{MESSAGES_SLOT_PREFIX}{}", self.0))
    }

    /// Realtime "replication" slot.
    pub fn replication_slot(&self) -> String {
        truncate_identifier(format!("{REPLICATION_SLOT_PREFIX}{}", self.0))
    }
}

/// Slugs are ASCII, so byte truncation never splits a character.
fn truncate_identifier(mut name: String) -> String {
    name.truncate(PG_IDENTIFIER_LIMIT);
    name
}

impl fmt::Display for TenantSlug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for TenantSlug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantSlug {
    type Error = SlugError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TenantSlug> for String {
    fn from(slug: TenantSlug) -> Self {
        slug.0
    }
}
