// Integration tests for the run controller against the scripted marketplace
// and transport. Every external call lands in one journal so ordering
// guarantees (destroy once, destroy last) can be checked directly.

mod common;

use common::{
    assert_destroyed_last, controller, error_kind, healthy_transport, loading_instance, offer, position,
    project, ready_marketplace, settings, CONTRACT_ID,
};
use speedrun_common::SpeedrunError;
use speedrun_orchestrator::{build_controller, CancelSignal};
use speedrun_providers::mock::{CallJournal, MockMarketplace, MockTransport};
use std::sync::Arc;
use std::time::Duration;

fn result_dirs(base: &std::path::Path) -> Vec<std::path::PathBuf> {
    std::fs::read_dir(base)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("speedrun_results_")
        })
        .collect()
}

#[tokio::test]
async fn test_full_run_selects_first_tier_offer() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal);
    let uploads = transport.upload_log();

    let ctl = controller(
        results.path(),
        ready_marketplace(&journal),
        transport,
        CancelSignal::never(),
    );
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(report.succeeded(), "outcome: {:?}", report.outcome);
    assert_eq!(report.offer.id, 101);
    assert_eq!(report.contract_id, CONTRACT_ID);
    assert!(report.destroyed);

    // Tier 1 hit: no further tiers queried.
    assert_eq!(journal.count("search:"), 1);
    assert_eq!(journal.count("create:101"), 1);

    let entries = journal.entries();
    let connect = position(&entries, "connect:ssh5.vast.ai:31337").unwrap();
    let put = position(&entries, "put:/root/project.tar.gz").unwrap();
    let extract = position(&entries, "exec:cd '/root' && tar -xzf project.tar.gz").unwrap();
    let pip = position(&entries, "exec:cd '/root' && pip install -r requirements.txt").unwrap();
    let stream = position(&entries, "stream:cd '/root' && python train.py").unwrap();
    let get = position(&entries, "get:").unwrap();
    let close = position(&entries, "close").unwrap();
    assert!(connect < put && put < extract && extract < pip && pip < stream);
    assert!(stream < get && get < close);
    assert_destroyed_last(&journal, CONTRACT_ID);

    let result = report.outcome.as_ref().unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.remote_root, "/root");

    // The local package is gone once the run is over.
    let uploaded = uploads.paths();
    assert_eq!(uploaded.len(), 1);
    assert!(!uploaded[0].exists());
}

#[tokio::test]
async fn test_no_offers_in_any_tier_aborts_without_instance() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();

    let ctl = controller(
        results.path(),
        MockMarketplace::new(journal.clone()),
        MockTransport::new(journal.clone()),
        CancelSignal::never(),
    );
    let res = ctl.run(&project_dir).await;

    assert!(matches!(error_kind(&res), Some(SpeedrunError::NoResourceAvailable)));
    assert_eq!(journal.count("search:"), 4);
    assert_eq!(journal.count("create:"), 0);
    assert_eq!(journal.count("destroy:"), 0);
    assert_eq!(journal.count("connect:"), 0);
}

#[tokio::test]
async fn test_search_stops_at_first_non_empty_tier() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let marketplace = MockMarketplace::new(journal.clone())
        .with_search_results(vec![
            vec![],
            vec![offer(7, 4, 20.0), offer(8, 4, 18.0)],
            vec![offer(9, 2, 1.0)],
        ])
        .with_contract(CONTRACT_ID)
        .with_polls(vec![vec![common::running_instance(CONTRACT_ID)]]);

    let ctl = controller(results.path(), marketplace, healthy_transport(&journal), CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert_eq!(journal.count("search:"), 2);
    assert_eq!(report.offer.id, 7);
    assert_eq!(journal.count("create:7"), 1);
    let searches: Vec<String> = journal
        .entries()
        .into_iter()
        .filter(|e| e.starts_with("search:"))
        .collect();
    assert!(searches[0].ends_with("num_gpus>=4 dph_total<10"));
    assert!(searches[1].ends_with("num_gpus>=4"));
}

#[tokio::test]
async fn test_missing_remote_entry_point_falls_back_to_project_name() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = MockTransport::new(journal.clone()).with_stream(&["ok"], 0);

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.outcome.as_ref().unwrap().remote_root, "/root/demo");
    assert_eq!(journal.count("stream:cd '/root/demo' && python train.py"), 1);
}

#[tokio::test]
async fn test_job_failure_skips_collection_and_destroys() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).with_stream(&["Traceback", "ValueError"], 1);

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(matches!(
        error_kind(&report.outcome),
        Some(SpeedrunError::JobFailed { exit_code: 1 })
    ));
    assert_eq!(journal.count("exec:find '/root' -name '*.pt'"), 0);
    assert_eq!(journal.count("get:"), 0);
    assert_eq!(journal.count("close"), 1);
    assert!(result_dirs(results.path()).is_empty());
    assert_destroyed_last(&journal, CONTRACT_ID);
}

#[tokio::test]
async fn test_artifacts_are_flattened_into_one_results_dir() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();

    let ctl = controller(
        results.path(),
        ready_marketplace(&journal),
        healthy_transport(&journal),
        CancelSignal::never(),
    );
    let report = ctl.run(&project_dir).await.unwrap();
    let result = report.outcome.as_ref().unwrap();

    let dirs = result_dirs(results.path());
    assert_eq!(dirs.len(), 1);
    assert_eq!(result.results_dir.as_deref(), Some(dirs[0].as_path()));
    assert_eq!(
        result.remote_artifacts,
        vec!["/root/checkpoints/model.pt".to_string(), "/root/weights.pth".to_string()]
    );

    let mut names: Vec<String> = std::fs::read_dir(&dirs[0])
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["model.pt".to_string(), "weights.pth".to_string()]);
    assert_eq!(
        std::fs::read_to_string(dirs[0].join("model.pt")).unwrap(),
        "mock contents of /root/checkpoints/model.pt"
    );
    assert_eq!(result.artifacts.len(), 2);
}

#[tokio::test]
async fn test_no_artifacts_is_not_an_error() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = MockTransport::new(journal.clone()).on_exec("-name 'train.py'", 0, "/root/train.py\n");

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    let result = report.outcome.as_ref().unwrap();
    assert!(result.artifacts.is_empty());
    assert!(result.results_dir.is_none());
    assert!(result_dirs(results.path()).is_empty());
}

#[tokio::test]
async fn test_ready_timeout_routes_through_destroy() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let marketplace = MockMarketplace::new(journal.clone())
        .with_search_results(vec![vec![offer(101, 8, 5.0)]])
        .with_contract(CONTRACT_ID)
        .with_polls(vec![vec![loading_instance(CONTRACT_ID)]]);

    let ctl = controller(results.path(), marketplace, healthy_transport(&journal), CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(matches!(
        error_kind(&report.outcome),
        Some(SpeedrunError::ReadyTimeout { contract_id: CONTRACT_ID, .. })
    ));
    assert!(journal.count("list") > 1);
    assert_eq!(journal.count("connect:"), 0);
    assert_destroyed_last(&journal, CONTRACT_ID);
}

#[tokio::test]
async fn test_upload_failure_closes_session_and_destroys() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).fail_on("put:");
    let uploads = transport.upload_log();

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(matches!(error_kind(&report.outcome), Some(SpeedrunError::Deployment(_))));
    assert_eq!(journal.count("stream:"), 0);
    assert_eq!(journal.count("close"), 1);
    assert_destroyed_last(&journal, CONTRACT_ID);
    let uploaded = uploads.paths();
    assert_eq!(uploaded.len(), 1);
    assert!(!uploaded[0].exists());
}

#[tokio::test]
async fn test_extract_failure_is_a_deployment_error() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).on_exec("tar -xzf", 2, "");
    let uploads = transport.upload_log();

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(matches!(error_kind(&report.outcome), Some(SpeedrunError::Deployment(_))));
    assert_eq!(journal.count("stream:"), 0);
    let uploaded = uploads.paths();
    assert_eq!(uploaded.len(), 1);
    assert!(!uploaded[0].exists());
    assert_destroyed_last(&journal, CONTRACT_ID);
}

#[tokio::test]
async fn test_dependency_install_failure_stops_before_job() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).on_exec("pip install", 1, "");

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(matches!(error_kind(&report.outcome), Some(SpeedrunError::Deployment(_))));
    assert_eq!(journal.count("stream:"), 0);
    assert_destroyed_last(&journal, CONTRACT_ID);
}

#[tokio::test]
async fn test_missing_requirements_skips_install() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).on_exec("test -f", 1, "");

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(journal.count("exec:cd '/root' && pip install"), 0);
}

#[tokio::test]
async fn test_collection_failure_still_closes_and_destroys() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).fail_on("get:");

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(matches!(error_kind(&report.outcome), Some(SpeedrunError::Deployment(_))));
    let entries = journal.entries();
    let close = position(&entries, "close").unwrap();
    let destroy = position(&entries, "destroy:").unwrap();
    assert!(close < destroy);
    assert_destroyed_last(&journal, CONTRACT_ID);
}

#[tokio::test]
async fn test_connect_failure_destroys_instance() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).with_connect_error("connection refused");

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(matches!(error_kind(&report.outcome), Some(SpeedrunError::Deployment(_))));
    assert_eq!(journal.count("close"), 0);
    assert_destroyed_last(&journal, CONTRACT_ID);
}

#[tokio::test]
async fn test_create_failure_never_destroys() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let marketplace = MockMarketplace::new(journal.clone())
        .with_search_results(vec![vec![offer(101, 8, 5.0)]])
        .with_create_error("offer no longer available");

    let ctl = controller(results.path(), marketplace, healthy_transport(&journal), CancelSignal::never());
    let res = ctl.run(&project_dir).await;

    assert!(matches!(error_kind(&res), Some(SpeedrunError::Provisioning(_))));
    assert_eq!(journal.count("destroy:"), 0);
    assert_eq!(journal.count("list"), 0);
}

#[tokio::test]
async fn test_cancellation_during_wait_routes_through_destroy() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let marketplace = MockMarketplace::new(journal.clone())
        .with_search_results(vec![vec![offer(101, 8, 5.0)]])
        .with_contract(CONTRACT_ID)
        .with_polls(vec![vec![loading_instance(CONTRACT_ID)]]);

    let mut s = settings(results.path());
    s.launch.ready_timeout = Duration::from_secs(30);
    let (handle, cancel) = CancelSignal::channel();
    let ctl = build_controller(
        &s,
        Arc::new(marketplace),
        Arc::new(healthy_transport(&journal)),
        cancel,
    );

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.cancel();
    });
    let report = tokio::time::timeout(Duration::from_secs(5), ctl.run(&project_dir))
        .await
        .expect("cancellation not honoured")
        .unwrap();

    assert!(matches!(error_kind(&report.outcome), Some(SpeedrunError::Cancelled)));
    assert_eq!(journal.count("connect:"), 0);
    assert_destroyed_last(&journal, CONTRACT_ID);
}

#[tokio::test]
async fn test_cancel_before_rent_creates_nothing() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let (handle, cancel) = CancelSignal::channel();
    handle.cancel();

    let ctl = controller(results.path(), ready_marketplace(&journal), healthy_transport(&journal), cancel);
    let res = ctl.run(&project_dir).await;

    assert!(matches!(error_kind(&res), Some(SpeedrunError::Cancelled)));
    assert_eq!(journal.count("create:"), 0);
    assert_eq!(journal.count("destroy:"), 0);
}

#[tokio::test]
async fn test_destroy_failure_does_not_mask_success() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let marketplace = ready_marketplace(&journal).with_destroy_error("api unavailable");

    let ctl = controller(results.path(), marketplace, healthy_transport(&journal), CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    assert!(report.succeeded());
    assert!(!report.destroyed);
    assert_destroyed_last(&journal, CONTRACT_ID);
}

#[tokio::test]
async fn test_cost_is_elapsed_hours_times_price() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();

    let ctl = controller(
        results.path(),
        ready_marketplace(&journal),
        healthy_transport(&journal),
        CancelSignal::never(),
    );
    let report = ctl.run(&project_dir).await.unwrap();

    assert_eq!(report.cost.price_per_hour, 5.0);
    let expected = report.cost.elapsed.as_secs_f64() / 3600.0 * 5.0;
    assert!((report.cost.total - expected).abs() < 1e-12);
    assert!(report.cost.elapsed > Duration::ZERO);
}

#[tokio::test]
async fn test_dry_run_only_searches() {
    let journal = CallJournal::new();
    let results = tempfile::tempdir().unwrap();

    let ctl = controller(
        results.path(),
        ready_marketplace(&journal),
        healthy_transport(&journal),
        CancelSignal::never(),
    );
    let offer = ctl.dry_run().await.unwrap();

    assert_eq!(offer.id, 101);
    assert_eq!(journal.entries().len(), 1);
    assert_eq!(journal.count("search:"), 1);
}

#[tokio::test]
async fn test_dry_run_propagates_search_errors() {
    let journal = CallJournal::new();
    let results = tempfile::tempdir().unwrap();
    let marketplace = MockMarketplace::new(journal.clone()).with_search_error("vastai: command not found");

    let ctl = controller(results.path(), marketplace, healthy_transport(&journal), CancelSignal::never());
    let err = ctl.dry_run().await.unwrap_err();

    assert!(err.to_string().contains("command not found"));
    assert_eq!(journal.count("create:"), 0);
}

/// Raise `handle` as soon as an entry starting with `prefix` shows up.
fn cancel_when_seen(journal: &CallJournal, prefix: &'static str, handle: speedrun_orchestrator::CancelHandle) {
    let journal = journal.clone();
    tokio::spawn(async move {
        while journal.count(prefix) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.cancel();
    });
}

#[tokio::test]
async fn test_cancellation_during_job_closes_session_then_destroys() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).hang_on("stream:");
    let uploads = transport.upload_log();
    let (handle, cancel) = CancelSignal::channel();

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, cancel);
    cancel_when_seen(&journal, "stream:", handle);
    let report = tokio::time::timeout(Duration::from_secs(5), ctl.run(&project_dir))
        .await
        .expect("cancellation not honoured")
        .unwrap();

    assert!(matches!(error_kind(&report.outcome), Some(SpeedrunError::Cancelled)));
    let entries = journal.entries();
    let close = position(&entries, "close").expect("session not closed");
    assert!(close < position(&entries, "destroy:").unwrap());
    assert_eq!(journal.count("get:"), 0);
    assert_destroyed_last(&journal, CONTRACT_ID);
    let uploaded = uploads.paths();
    assert_eq!(uploaded.len(), 1);
    assert!(!uploaded[0].exists());
}

#[tokio::test]
async fn test_cancellation_during_collection_closes_session_then_destroys() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).hang_on("get:");
    let uploads = transport.upload_log();
    let (handle, cancel) = CancelSignal::channel();

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, cancel);
    cancel_when_seen(&journal, "get:", handle);
    let report = tokio::time::timeout(Duration::from_secs(5), ctl.run(&project_dir))
        .await
        .expect("cancellation not honoured")
        .unwrap();

    assert!(matches!(error_kind(&report.outcome), Some(SpeedrunError::Cancelled)));
    assert_eq!(journal.count("get:"), 1);
    let entries = journal.entries();
    let close = position(&entries, "close").expect("session not closed");
    assert!(close < position(&entries, "destroy:").unwrap());
    assert_destroyed_last(&journal, CONTRACT_ID);
    assert!(!uploads.paths()[0].exists());
}

#[tokio::test]
async fn test_panic_in_remote_phase_still_destroys_last() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = healthy_transport(&journal).panic_on("stream:");
    let uploads = transport.upload_log();

    let ctl = controller(results.path(), ready_marketplace(&journal), transport, CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    let err = report.outcome.as_ref().unwrap_err();
    assert!(format!("{:#}", err).contains("panicked"), "got {:#}", err);
    assert!(report.destroyed);
    assert_destroyed_last(&journal, CONTRACT_ID);
    assert!(!uploads.paths()[0].exists());
}

#[tokio::test]
async fn test_single_char_artifact_glob_is_collected() {
    let journal = CallJournal::new();
    let (_root, project_dir) = project();
    let results = tempfile::tempdir().unwrap();
    let transport = MockTransport::new(journal.clone())
        .on_exec("-name 'train.py'", 0, "/root/train.py\n")
        .on_exec("-name 'ckpt_?.pt'", 0, "/root/ckpt_1.pt\n/root/ckpt_12.pt\n")
        .with_stream(&["done"], 0);

    let mut s = settings(results.path());
    s.artifact_patterns = speedrun_common::artifact_patterns::ArtifactPatterns::parse(Some("ckpt_?.pt")).unwrap();
    let ctl = build_controller(&s, Arc::new(ready_marketplace(&journal)), Arc::new(transport), CancelSignal::never());
    let report = ctl.run(&project_dir).await.unwrap();

    let result = report.outcome.as_ref().unwrap();
    assert_eq!(result.remote_artifacts, vec!["/root/ckpt_1.pt".to_string()]);
    assert_eq!(journal.count("get:/root/ckpt_1.pt"), 1);
    assert_eq!(journal.count("get:/root/ckpt_12.pt"), 0);
}
