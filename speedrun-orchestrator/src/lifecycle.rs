use anyhow::Result;
use speedrun_common::{Instance, SpeedrunError};
use speedrun_providers::inventory::LaunchSpec;
use speedrun_providers::Marketplace;
use std::sync::Arc;
use tokio::time::{sleep, Instant};

use crate::settings::LaunchSettings;

/// Creates, awaits and destroys marketplace instances.
pub struct LifecycleManager {
    marketplace: Arc<dyn Marketplace>,
    launch: LaunchSettings,
}

impl LifecycleManager {
    pub fn new(marketplace: Arc<dyn Marketplace>, launch: LaunchSettings) -> Self {
        Self { marketplace, launch }
    }

    pub async fn create(&self, offer_id: u64) -> Result<u64> {
        println!("🚀 Creating instance...");
        let spec = LaunchSpec {
            offer_id,
            image: self.launch.image.clone(),
            disk_gb: self.launch.disk_gb,
            label: self.launch.label.clone(),
        };
        let contract_id = self
            .marketplace
            .create_instance(&spec)
            .await
            .map_err(|e| match e.downcast::<SpeedrunError>() {
                Ok(known) => anyhow::Error::from(known),
                Err(other) => SpeedrunError::Provisioning(other.to_string()).into(),
            })?;
        println!("✅ Instance created: {}", contract_id);
        Ok(contract_id)
    }

    /// Poll the instance list until `contract_id` reports running.
    ///
    /// Bounded by `ready_timeout`; list failures are retried within the same
    /// deadline since the marketplace API is flaky while an instance boots.
    pub async fn await_running(&self, contract_id: u64) -> Result<Instance> {
        println!("⏳ Waiting for instance to be ready...");
        let started = Instant::now();
        let deadline = started + self.launch.ready_timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.marketplace.list_instances().await {
                Ok(instances) => {
                    if let Some(instance) = instances
                        .into_iter()
                        .find(|i| i.contract_id == contract_id && i.is_running())
                    {
                        println!("✅ Instance is ready!");
                        log_connection_fields(&instance);
                        return Ok(instance);
                    }
                }
                Err(e) => {
                    tracing::warn!(contract_id, attempt, error = %e, "instance list failed, retrying");
                }
            }

            let now = Instant::now();
            if now + self.launch.poll_interval > deadline {
                return Err(SpeedrunError::ReadyTimeout {
                    contract_id,
                    waited_secs: now.duration_since(started).as_secs(),
                }
                .into());
            }
            if attempt % 6 == 0 {
                println!(
                    "⏳ Still waiting for instance {} (~{}s elapsed)",
                    contract_id,
                    now.duration_since(started).as_secs()
                );
            }
            sleep(self.launch.poll_interval).await;
        }
    }

    /// Best-effort destroy. Returns whether the backend acknowledged it.
    pub async fn destroy(&self, contract_id: u64) -> bool {
        println!("🗑️ Destroying instance {}...", contract_id);
        match self.marketplace.destroy_instance(contract_id).await {
            Ok(()) => {
                println!("✅ Instance destroyed");
                true
            }
            Err(e) => {
                println!(
                    "❌ Failed to destroy instance {}: {}. Destroy it manually with `vastai destroy instance {}`.",
                    contract_id, e, contract_id
                );
                tracing::error!(contract_id, error = %e, "destroy failed");
                false
            }
        }
    }
}

fn log_connection_fields(instance: &Instance) {
    if let Some(obj) = instance.metadata.as_object() {
        let fields: Vec<&str> = obj
            .keys()
            .filter(|k| {
                let k = k.to_ascii_lowercase();
                ["ssh", "port", "host", "ip"].iter().any(|t| k.contains(t))
            })
            .map(|k| k.as_str())
            .collect();
        if !fields.is_empty() {
            tracing::debug!(contract_id = instance.contract_id, ?fields, "connection-related fields");
        }
    }
}
