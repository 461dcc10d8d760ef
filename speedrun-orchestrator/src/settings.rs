use anyhow::{Context, Result};
use speedrun_common::artifact_patterns::ArtifactPatterns;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "pytorch/pytorch:2.1.0-cuda11.8-cudnn8-runtime";

/// Offer search thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPolicy {
    pub max_price_per_hour: f64,
    pub min_reliability: f64,
    pub limit: u32,
}

impl Default for SearchPolicy {
    fn default() -> Self {
        Self {
            max_price_per_hour: 10.0,
            min_reliability: 0.95,
            limit: 10,
        }
    }
}

/// How instances are created and awaited.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSettings {
    pub image: String,
    pub disk_gb: u32,
    pub label: String,
    pub poll_interval: Duration,
    pub ready_timeout: Duration,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            image: DEFAULT_IMAGE.to_string(),
            disk_gb: 50,
            label: "speedrun".to_string(),
            poll_interval: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SshSettings {
    pub user: String,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            identity_file: None,
            connect_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub api_key: String,
    pub vastai_bin: String,
    pub search: SearchPolicy,
    pub launch: LaunchSettings,
    pub ssh: SshSettings,
    pub artifact_patterns: ArtifactPatterns,
    pub results_base: PathBuf,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable source. Empty or unparsable
    /// values fall back to defaults; only the access token is required and
    /// a malformed artifact glob is rejected.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("VAST_API_KEY")
            .ok_or_else(|| anyhow::anyhow!("VAST_API_KEY environment variable not set"))?;

        let search_defaults = SearchPolicy::default();
        let search = SearchPolicy {
            max_price_per_hour: get("SPEEDRUN_MAX_PRICE_PER_HOUR")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v > 0.0)
                .unwrap_or(search_defaults.max_price_per_hour),
            min_reliability: get("SPEEDRUN_MIN_RELIABILITY")
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| (0.0..=1.0).contains(v))
                .unwrap_or(search_defaults.min_reliability),
            limit: get("SPEEDRUN_SEARCH_LIMIT")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(search_defaults.limit),
        };

        let launch_defaults = LaunchSettings::default();
        let launch = LaunchSettings {
            image: get("SPEEDRUN_IMAGE").unwrap_or(launch_defaults.image),
            disk_gb: get("SPEEDRUN_DISK_GB")
                .and_then(|v| v.parse::<u32>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(launch_defaults.disk_gb),
            label: get("SPEEDRUN_LABEL").unwrap_or(launch_defaults.label),
            poll_interval: get("SPEEDRUN_POLL_INTERVAL_S")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(launch_defaults.poll_interval),
            ready_timeout: get("SPEEDRUN_READY_TIMEOUT_S")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(launch_defaults.ready_timeout),
        };

        let ssh_defaults = SshSettings::default();
        let ssh = SshSettings {
            user: get("SPEEDRUN_SSH_USER").unwrap_or(ssh_defaults.user),
            identity_file: get("SPEEDRUN_SSH_KEY").map(PathBuf::from),
            connect_timeout: get("SPEEDRUN_SSH_CONNECT_TIMEOUT_S")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .map(Duration::from_secs)
                .unwrap_or(ssh_defaults.connect_timeout),
        };

        let artifact_patterns = ArtifactPatterns::parse(get("SPEEDRUN_ARTIFACT_PATTERNS").as_deref())
            .context("SPEEDRUN_ARTIFACT_PATTERNS")?;

        Ok(Self {
            api_key,
            vastai_bin: get("SPEEDRUN_VASTAI_BIN").unwrap_or_else(|| "vastai".to_string()),
            search,
            launch,
            ssh,
            artifact_patterns,
            results_base: get("SPEEDRUN_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
        })
    }
}
