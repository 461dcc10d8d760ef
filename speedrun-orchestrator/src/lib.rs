pub mod artifacts;
pub mod cancel;
pub mod catalog;
pub mod connection;
pub mod controller;
pub mod deploy;
pub mod finops;
pub mod lifecycle;
pub mod packaging;
pub mod settings;

use speedrun_providers::{Marketplace, RemoteTransport};
use std::sync::Arc;

pub use cancel::{CancelHandle, CancelSignal};
pub use controller::{RunContext, RunController, RunReport};
pub use settings::Settings;

/// Assemble a controller from settings and the two backends.
pub fn build_controller(
    settings: &Settings,
    marketplace: Arc<dyn Marketplace>,
    transport: Arc<dyn RemoteTransport>,
    cancel: CancelSignal,
) -> RunController {
    let catalog = catalog::CatalogClient::new(marketplace.clone(), settings.search.clone());
    let lifecycle = lifecycle::LifecycleManager::new(marketplace, settings.launch.clone());
    let collector = artifacts::ArtifactCollector::new(
        settings.artifact_patterns.clone(),
        settings.results_base.clone(),
    );
    let driver = deploy::DeploymentDriver::new(transport, collector, cancel.clone());
    RunController::new(catalog, lifecycle, driver, cancel)
}
