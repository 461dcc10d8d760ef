use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub mod artifact_patterns;
pub mod error;
pub mod shell;

pub use error::SpeedrunError;

// --- Enums ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Pending,       // Created on the marketplace, not reported running yet
    Running,       // Container is up, SSH should be reachable
    Destroyed,     // Destroy request acknowledged
    Other(String), // Any backend status we do not model (loading, exited, ...)
}

impl InstanceStatus {
    pub fn parse(s: Option<&str>) -> Self {
        match s.map(|v| v.trim().to_ascii_lowercase()) {
            None => InstanceStatus::Pending,
            Some(v) => match v.as_str() {
                "" | "created" | "pending" | "scheduling" => InstanceStatus::Pending,
                "running" => InstanceStatus::Running,
                "destroyed" => InstanceStatus::Destroyed,
                _ => InstanceStatus::Other(v),
            },
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Destroyed => "destroyed",
            InstanceStatus::Other(s) => s.as_str(),
        }
    }
}

// --- Entities ---

/// A rentable machine advertised by the marketplace. Field names follow the
/// vast.ai offer records.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Offer {
    pub id: u64,
    #[serde(rename = "num_gpus")]
    pub gpu_count: u32,
    #[serde(rename = "gpu_ram", default)]
    pub gpu_ram_mb: f64,
    #[serde(rename = "gpu_total_ram", default)]
    pub gpu_total_ram_mb: f64,
    #[serde(rename = "dph_total")]
    pub price_per_hour: f64,
    #[serde(default)]
    pub reliability: f64,
    #[serde(default)]
    pub gpu_name: String,
}

impl Offer {
    pub fn gpu_ram_gb(&self) -> f64 {
        self.gpu_ram_mb / 1024.0
    }

    pub fn gpu_total_ram_gb(&self) -> f64 {
        self.gpu_total_ram_mb / 1024.0
    }

    pub fn summary(&self) -> String {
        format!(
            "{}x {} ({:.1}GB each, {:.1}GB total) - ${:.2}/hr",
            self.gpu_count,
            self.gpu_name,
            self.gpu_ram_gb(),
            self.gpu_total_ram_gb(),
            self.price_per_hour
        )
    }
}

/// A provisioned instance as reported by the marketplace instance list.
///
/// `metadata` keeps the raw record: connectivity fields come in several
/// shapes depending on how the host exposes SSH.
#[derive(Debug, Clone, PartialEq)]
pub struct Instance {
    pub contract_id: u64,
    pub status: InstanceStatus,
    pub public_ipaddr: Option<String>,
    pub price_per_hour: Option<f64>,
    pub metadata: serde_json::Value,
}

impl Instance {
    pub fn from_record(record: serde_json::Value) -> Result<Self, SpeedrunError> {
        let contract_id = record
            .get("id")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| {
                SpeedrunError::BackendProtocol("instance record without numeric 'id'".to_string())
            })?;
        let status = InstanceStatus::parse(record.get("actual_status").and_then(|v| v.as_str()));
        let public_ipaddr = record
            .get("public_ipaddr")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let price_per_hour = record.get("dph_total").and_then(|v| v.as_f64());
        Ok(Self {
            contract_id,
            status,
            public_ipaddr,
            price_per_hour,
            metadata: record,
        })
    }

    pub fn is_running(&self) -> bool {
        self.status == InstanceStatus::Running
    }
}

/// Reachable SSH endpoint of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Outcome of the remote phase of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub exit_code: i32,
    pub remote_root: String,
    pub remote_artifacts: Vec<String>,
    pub results_dir: Option<PathBuf>,
    pub artifacts: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CostRecord {
    pub elapsed: Duration,
    pub price_per_hour: f64,
    pub total: f64,
}
