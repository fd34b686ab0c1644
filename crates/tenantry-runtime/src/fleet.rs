//! Container fleet inspection: which containers belong to a tenant, what
//! state they are in, and the order to bring them up.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::docker::DockerCli;
use crate::error::{FleetError, FleetResult};

/// Services that must come up first, in order. Anything else goes last.
pub const SERVICE_ORDER: &[&str] = &["meta", "auth", "rest", "imgproxy", "storage", "nginx"];

/// One container as reported by `docker ps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRecord {
    pub name: String,
    #[serde(rename = "status")]
    pub state: String,
    pub image: String,
    pub created: String,
    pub ports: String,
}

impl ContainerRecord {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

fn unknown() -> String {
    "unknown".to_string()
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "Names", default)]
    names: String,
    #[serde(rename = "State", default = "unknown")]
    state: String,
    #[serde(rename = "Image", default = "unknown")]
    image: String,
    #[serde(rename = "CreatedAt", default)]
    created_at: String,
    #[serde(rename = "Ports", default)]
    ports: String,
}

/// Parse `docker ps -a --format {{json .}}` output, keeping containers with
/// a name ending in `-<tenant>`.
///
/// `Names` may hold several comma-separated names; the matching one becomes
/// the record's name. Lines that are not JSON are skipped.
pub fn parse_ps_output(stdout: &str, tenant: &str) -> Vec<ContainerRecord> {
    let suffix = format!("-{tenant}");
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<PsLine>(line) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                warn!(error = %e, line, "skipping unparseable docker ps line");
                None
            }
        })
        .filter_map(|parsed| {
            let name = parsed
                .names
                .split(',')
                .map(str::trim)
                .find(|n| n.ends_with(&suffix))?
                .to_string();
            Some(ContainerRecord {
                name,
                state: parsed.state,
                image: parsed.image,
                created: parsed.created_at,
                ports: parsed.ports,
            })
        })
        .collect()
}

/// Aggregate state of a tenant's fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FleetStatus {
    NotFound,
    Running,
    Stopped,
    Partial,
}

impl FleetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FleetStatus::NotFound => "not_found",
            FleetStatus::Running => "running",
            FleetStatus::Stopped => "stopped",
            FleetStatus::Partial => "partial",
        }
    }
}

pub fn aggregate_status(records: &[ContainerRecord]) -> FleetStatus {
    let running = records.iter().filter(|r| r.is_running()).count();
    match (records.len(), running) {
        (0, _) => FleetStatus::NotFound,
        (total, r) if r == total => FleetStatus::Running,
        (_, 0) => FleetStatus::Stopped,
        _ => FleetStatus::Partial,
    }
}

/// Status report for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub status: FleetStatus,
    pub containers: Vec<ContainerRecord>,
    pub running: usize,
    pub total: usize,
}

impl StatusReport {
    pub fn from_records(containers: Vec<ContainerRecord>) -> Self {
        Self {
            status: aggregate_status(&containers),
            running: containers.iter().filter(|r| r.is_running()).count(),
            total: containers.len(),
            containers,
        }
    }
}

/// Position of the first [`SERVICE_ORDER`] entry found in the service part
/// of `name` (the name without the `-<tenant>` suffix).
fn service_priority(name: &str, suffix: &str) -> usize {
    let service = name.strip_suffix(suffix).unwrap_or(name).to_lowercase();
    SERVICE_ORDER
        .iter()
        .position(|s| service.contains(s))
        .unwrap_or(SERVICE_ORDER.len())
}

/// Sort containers into start/restart order. Stable, so unmatched
/// containers keep their listing order at the end.
pub fn order_for_lifecycle(records: &mut [ContainerRecord], tenant: &str) {
    let suffix = format!("-{tenant}");
    records.sort_by_key(|r| service_priority(&r.name, &suffix));
}

/// Lists and summarizes tenant containers.
#[derive(Clone)]
pub struct FleetInspector {
    docker: DockerCli,
}

impl FleetInspector {
    pub fn new(docker: DockerCli) -> Self {
        Self { docker }
    }

    pub async fn list_containers(&self, tenant: &str) -> FleetResult<Vec<ContainerRecord>> {
        let out = self.docker.ps_all().await?;
        if !out.success() {
            return Err(FleetError::ExternalTool {
                command: format!("{} ps -a", self.docker.bin()),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(parse_ps_output(&out.stdout, tenant))
    }

    pub async fn status(&self, tenant: &str) -> FleetResult<StatusReport> {
        Ok(StatusReport::from_records(self.list_containers(tenant).await?))
    }
}
