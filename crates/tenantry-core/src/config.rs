//! tenantry.toml configuration parser.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! usable development configuration. Secrets and the database DSN are usually
//! supplied through the environment, which overrides the file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

pub const ENV_DB_DSN: &str = "TENANTRY_DB_DSN";
pub const ENV_ADMIN_DSN: &str = "TENANTRY_ADMIN_DSN";
pub const ENV_SECRET_KEY: &str = "TENANTRY_SECRET_KEY";
pub const ENV_SHARED_TOKEN: &str = "TENANTRY_SHARED_TOKEN";
pub const ENV_DELETE_PASSWORD: &str = "TENANTRY_DELETE_PASSWORD";
pub const ENV_SCRIPTS_DIR: &str = "TENANTRY_SCRIPTS_DIR";
pub const ENV_PORT: &str = "TENANTRY_PORT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantryConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub secrets: SecretsConfig,
    pub scripts: ScriptsConfig,
    pub runtime: RuntimeConfig,
    pub teardown: TeardownConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Bookkeeping database.
    pub dsn: Option<String>,
    /// Privileged connection used for replication-slot and database
    /// teardown. Falls back to `dsn`.
    pub admin_dsn: Option<String>,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            admin_dsn: None,
            min_connections: 1,
            max_connections: 5,
            acquire_timeout_secs: 30,
        }
    }
}

impl DatabaseConfig {
    pub fn admin_dsn(&self) -> Option<&str> {
        self.admin_dsn.as_deref().or(self.dsn.as_deref())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("dsn", &self.dsn.as_ref().map(|_| "[REDACTED]"))
            .field("admin_dsn", &self.admin_dsn.as_ref().map(|_| "[REDACTED]"))
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

/// Where tenant/membership/job bookkeeping lives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Postgres,
    /// Local redb file under `storage.data_dir`.
    Embedded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Postgres,
            data_dir: PathBuf::from("/var/lib/tenantry"),
        }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretsConfig {
    /// URL-safe base64 of 32 random bytes.
    pub encryption_key: Option<String>,
    /// Token presented by the gateway when fetching encrypted service keys.
    pub shared_token: Option<String>,
    /// Password required to delete a tenant.
    pub delete_password: Option<String>,
}

impl fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("SecretsConfig")
            .field("encryption_key", &redact(&self.encryption_key))
            .field("shared_token", &redact(&self.shared_token))
            .field("delete_password", &redact(&self.delete_password))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    pub dir: PathBuf,
    pub shell: String,
    pub provision: String,
    pub duplicate: String,
    pub delete: String,
    pub extract_tokens: String,
    pub timeout_secs: u64,
    /// Key of the anonymous-role credential in the extractor output.
    pub anon_key_var: String,
    /// Key of the privileged-role credential in the extractor output.
    pub service_role_key_var: String,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("scripts"),
            shell: "bash".to_string(),
            provision: "generate_project.sh".to_string(),
            duplicate: "duplicate_project.sh".to_string(),
            delete: "delete_project.sh".to_string(),
            extract_tokens: "extract_token.sh".to_string(),
            timeout_secs: 1800,
            anon_key_var: "ANON_KEY_PROJETO".to_string(),
            service_role_key_var: "SERVICE_ROLE_KEY_PROJETO".to_string(),
        }
    }
}

impl ScriptsConfig {
    pub fn path(&self, script: &str) -> PathBuf {
        self.dir.join(script)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub docker_bin: String,
    pub command_timeout_secs: u64,
    /// Prefix of per-service container names (`<prefix>-<service>-<slug>`).
    pub container_prefix: String,
    pub start_stagger_ms: u64,
    pub restart_grace_secs: u32,
    pub default_log_lines: u32,
    pub max_log_lines: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            command_timeout_secs: 120,
            container_prefix: "supabase".to_string(),
            start_stagger_ms: 2000,
            restart_grace_secs: 30,
            default_log_lines: 100,
            max_log_lines: 5000,
        }
    }
}

impl RuntimeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn start_stagger(&self) -> Duration {
        Duration::from_millis(self.start_stagger_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeardownConfig {
    /// Process-wide containers paused while a tenant is torn down.
    pub shared_containers: Vec<String>,
    pub settle_delay_ms: u64,
    pub connection_drain_timeout_ms: u64,
    pub slot_release_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for TeardownConfig {
    fn default() -> Self {
        Self {
            shared_containers: vec![
                "realtime-dev.supabase-realtime".to_string(),
                "supabase-pooler".to_string(),
            ],
            settle_delay_ms: 2000,
            connection_drain_timeout_ms: 10_000,
            slot_release_timeout_ms: 5000,
            poll_interval_ms: 250,
        }
    }
}

impl TeardownConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn connection_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_drain_timeout_ms)
    }

    pub fn slot_release_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_release_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub max_concurrent_jobs: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
        }
    }
}

impl TenantryConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load the file (if any), apply environment overrides, and validate.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_from(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override file values from an environment lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dsn) = lookup(ENV_DB_DSN) {
            self.database.dsn = Some(dsn);
        }
        if let Some(dsn) = lookup(ENV_ADMIN_DSN) {
            self.database.admin_dsn = Some(dsn);
        }
        if let Some(key) = lookup(ENV_SECRET_KEY) {
            self.secrets.encryption_key = Some(key);
        }
        if let Some(token) = lookup(ENV_SHARED_TOKEN) {
            self.secrets.shared_token = Some(token);
        }
        if let Some(password) = lookup(ENV_DELETE_PASSWORD) {
            self.secrets.delete_password = Some(password);
        }
        if let Some(dir) = lookup(ENV_SCRIPTS_DIR) {
            self.scripts.dir = PathBuf::from(dir);
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.server.port = port
                .parse()
                .with_context(|| format!("{ENV_PORT} is not a port number: {port}"))?;
        }
        Ok(())
    }

    /// Reject values that cannot work at all.
    pub fn validate(&self) -> anyhow::Result<()> {
        let db = &self.database;
        if db.min_connections == 0 || db.max_connections < db.min_connections {
            bail!(
                "database pool bounds invalid: min={} max={}",
                db.min_connections,
                db.max_connections
            );
        }
        if self.storage.backend == StorageBackend::Postgres && db.dsn.is_none() {
            bail!("postgres storage requires database.dsn or {ENV_DB_DSN}");
        }
        if self.scripts.timeout_secs == 0 || self.runtime.command_timeout_secs == 0 {
            bail!("script and command timeouts must be non-zero");
        }
        if self.teardown.shared_containers.iter().any(|c| c.trim().is_empty()) {
            bail!("teardown.shared_containers contains an empty name");
        }
        if self.teardown.poll_interval_ms == 0 {
            bail!("teardown.poll_interval_ms must be non-zero");
        }
        if self.orchestrator.max_concurrent_jobs == 0 {
            bail!("orchestrator.max_concurrent_jobs must be non-zero");
        }
        if self.runtime.default_log_lines == 0
            || self.runtime.default_log_lines > self.runtime.max_log_lines
        {
            bail!("runtime.default_log_lines must be within 1..=max_log_lines");
        }
        Ok(())
    }
}
