use crate::{inventory, Marketplace};
use anyhow::Result;
use async_trait::async_trait;
use speedrun_common::{Instance, Offer, SpeedrunError};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Marketplace backed by the `vastai` command-line client (`--raw` JSON output).
pub struct VastAiMarketplace {
    binary: String,
    api_key: String,
    command_timeout: Duration,
}

impl VastAiMarketplace {
    pub fn new(binary: String, api_key: String) -> Self {
        let binary = binary.trim().to_string();
        let api_key = api_key.trim().to_string();
        Self {
            binary: if binary.is_empty() { "vastai".to_string() } else { binary },
            api_key,
            // The CLI has no overall timeout of its own; a stalled call would hang the run.
            command_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Run `vastai <args> --raw` and return stdout. Nonzero exit is an error
    /// carrying stderr.
    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .arg("--raw")
            .arg("--api-key")
            .arg(&self.api_key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(binary = %self.binary, args = ?args, "vastai call");

        let child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!(
                "Failed to spawn '{}': {}. Make sure the vast.ai CLI is installed (pip install vastai).",
                self.binary,
                e
            )
        })?;

        let output = match tokio::time::timeout(self.command_timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(anyhow::anyhow!(
                    "vastai {} timed out after {}s",
                    args.first().map(String::as_str).unwrap_or(""),
                    self.command_timeout.as_secs()
                ))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow::anyhow!(
                "vastai command failed ({}): {}",
                output.status,
                stderr.trim()
            ));
        }
        Ok(output.stdout)
    }

    async fn run_json(&self, args: &[String]) -> Result<serde_json::Value> {
        let stdout = self.run(args).await?;
        parse_json(&stdout)
    }
}

fn parse_json(stdout: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(stdout).map_err(|e| {
        SpeedrunError::BackendProtocol(format!("failed to parse vastai response: {}", e)).into()
    })
}

fn parse_offers(value: serde_json::Value) -> Result<Vec<Offer>> {
    if !value.is_array() {
        return Err(SpeedrunError::BackendProtocol(
            "offer search did not return a list".to_string(),
        )
        .into());
    }
    serde_json::from_value(value).map_err(|e| {
        SpeedrunError::BackendProtocol(format!("malformed offer record: {}", e)).into()
    })
}

fn parse_contract(value: &serde_json::Value) -> Result<u64> {
    if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
        let msg = value
            .get("msg")
            .or_else(|| value.get("error"))
            .map(|v| v.to_string())
            .unwrap_or_else(|| value.to_string());
        return Err(SpeedrunError::Provisioning(msg).into());
    }
    value
        .get("new_contract")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| {
            SpeedrunError::BackendProtocol(format!("no 'new_contract' in create response: {}", value))
                .into()
        })
}

fn parse_instances(value: serde_json::Value) -> Result<Vec<Instance>> {
    let records = match value {
        serde_json::Value::Array(records) => records,
        // Some CLI versions wrap the list.
        serde_json::Value::Object(mut obj) => match obj.remove("instances") {
            Some(serde_json::Value::Array(records)) => records,
            _ => {
                return Err(SpeedrunError::BackendProtocol(
                    "instance list is neither a list nor {\"instances\": [...]}".to_string(),
                )
                .into())
            }
        },
        other => {
            return Err(SpeedrunError::BackendProtocol(format!(
                "unexpected instance list payload: {}",
                other
            ))
            .into())
        }
    };
    records
        .into_iter()
        .map(|r| Instance::from_record(r).map_err(anyhow::Error::from))
        .collect()
}

#[async_trait]
impl Marketplace for VastAiMarketplace {
    async fn search_offers(&self, query: &inventory::OfferQuery) -> Result<Vec<Offer>> {
        let args = vec![
            "search".to_string(),
            "offers".to_string(),
            query.filter.clone(),
            "--order".to_string(),
            query.order.clone(),
            "--limit".to_string(),
            query.limit.to_string(),
        ];
        let value = self.run_json(&args).await?;
        parse_offers(value)
    }

    async fn create_instance(&self, spec: &inventory::LaunchSpec) -> Result<u64> {
        let args = vec![
            "create".to_string(),
            "instance".to_string(),
            spec.offer_id.to_string(),
            "--image".to_string(),
            spec.image.clone(),
            "--disk".to_string(),
            spec.disk_gb.to_string(),
            "--label".to_string(),
            spec.label.clone(),
            "--ssh".to_string(),
            "--direct".to_string(),
        ];
        let stdout = self
            .run(&args)
            .await
            .map_err(|e| SpeedrunError::Provisioning(e.to_string()))?;
        let value = parse_json(&stdout)?;
        parse_contract(&value)
    }

    async fn list_instances(&self) -> Result<Vec<Instance>> {
        let args = vec!["show".to_string(), "instances".to_string()];
        let value = self.run_json(&args).await?;
        parse_instances(value)
    }

    async fn destroy_instance(&self, contract_id: u64) -> Result<()> {
        let args = vec![
            "destroy".to_string(),
            "instance".to_string(),
            contract_id.to_string(),
        ];
        // Output format of destroy varies between CLI versions; only the exit status matters.
        self.run(&args).await?;
        Ok(())
    }
}
