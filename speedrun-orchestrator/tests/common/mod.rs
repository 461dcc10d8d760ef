// Common test fixtures: offers, instance records, scratch projects and a
// controller wired to the scripted marketplace and transport.
#![allow(dead_code)]

use serde_json::json;
use speedrun_common::{Instance, Offer, SpeedrunError};
use speedrun_orchestrator::{build_controller, CancelSignal, RunController, Settings};
use speedrun_providers::mock::{CallJournal, MockMarketplace, MockTransport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const CONTRACT_ID: u64 = 4242;

pub fn offer(id: u64, gpus: u32, price: f64) -> Offer {
    Offer {
        id,
        gpu_count: gpus,
        gpu_ram_mb: 81920.0,
        gpu_total_ram_mb: 81920.0 * gpus as f64,
        price_per_hour: price,
        reliability: 0.99,
        gpu_name: "H100 SXM".to_string(),
    }
}

pub fn running_instance(contract_id: u64) -> Instance {
    Instance::from_record(json!({
        "id": contract_id,
        "actual_status": "running",
        "public_ipaddr": "203.0.113.7",
        "ssh_host": "ssh5.vast.ai",
        "ssh_port": 31337,
        "dph_total": 5.0
    }))
    .unwrap()
}

pub fn loading_instance(contract_id: u64) -> Instance {
    Instance::from_record(json!({
        "id": contract_id,
        "actual_status": "loading",
        "public_ipaddr": "203.0.113.7"
    }))
    .unwrap()
}

/// A scratch project named `demo` with an entry point, a requirements file
/// and a dotfile that must not be shipped.
pub fn project() -> (TempDir, std::path::PathBuf) {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("demo");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("train.py"), "print('training')\n").unwrap();
    std::fs::write(dir.join("requirements.txt"), "torch\n").unwrap();
    std::fs::write(dir.join(".env"), "SECRET=1\n").unwrap();
    (root, dir)
}

pub fn settings(results_base: &Path) -> Settings {
    let base = results_base.to_string_lossy().to_string();
    let mut settings = Settings::from_lookup(|name| match name {
        "VAST_API_KEY" => Some("test-key".to_string()),
        "SPEEDRUN_RESULTS_DIR" => Some(base.clone()),
        _ => None,
    })
    .unwrap();
    settings.launch.poll_interval = Duration::from_millis(5);
    settings.launch.ready_timeout = Duration::from_millis(200);
    settings
}

pub fn controller(
    results_base: &Path,
    marketplace: MockMarketplace,
    transport: MockTransport,
    cancel: CancelSignal,
) -> RunController {
    build_controller(
        &settings(results_base),
        Arc::new(marketplace),
        Arc::new(transport),
        cancel,
    )
}

/// Marketplace that offers one 8-GPU machine and reports it running on the
/// second poll.
pub fn ready_marketplace(journal: &CallJournal) -> MockMarketplace {
    MockMarketplace::new(journal.clone())
        .with_search_results(vec![vec![offer(101, 8, 5.0)]])
        .with_contract(CONTRACT_ID)
        .with_polls(vec![
            vec![loading_instance(CONTRACT_ID)],
            vec![running_instance(CONTRACT_ID)],
        ])
}

/// Transport whose remote side has the project extracted under /root.
pub fn healthy_transport(journal: &CallJournal) -> MockTransport {
    MockTransport::new(journal.clone())
        .on_exec("-name 'train.py'", 0, "/root/train.py\n")
        .on_exec("-name '*.pt'", 0, "/root/checkpoints/model.pt\n")
        .on_exec("-name '*.pth'", 0, "/root/weights.pth\n")
        .with_stream(&["epoch 1 loss 0.9", "epoch 2 loss 0.4"], 0)
}

/// Index of the first journal entry starting with `prefix`.
pub fn position(entries: &[String], prefix: &str) -> Option<usize> {
    entries.iter().position(|e| e.starts_with(prefix))
}

/// Asserts destroy was called exactly once and nothing followed it.
pub fn assert_destroyed_last(journal: &CallJournal, contract_id: u64) {
    let destroy = format!("destroy:{}", contract_id);
    assert_eq!(journal.count("destroy:"), 1, "journal: {:?}", journal.entries());
    assert_eq!(journal.last().as_deref(), Some(destroy.as_str()), "journal: {:?}", journal.entries());
}

/// The typed error behind an outcome, if any.
pub fn error_kind<T>(result: &anyhow::Result<T>) -> Option<&SpeedrunError> {
    result.as_ref().err().and_then(|e| e.downcast_ref::<SpeedrunError>())
}
