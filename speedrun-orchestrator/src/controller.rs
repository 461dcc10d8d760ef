//! Run orchestration: search, rent, deploy, collect, destroy.
//!
//! Once an instance has been created the controller owns its teardown:
//! `destroy` is called exactly once, after the remote phase has finished,
//! failed, panicked or been cancelled, and nothing talks to the marketplace
//! after it.

use anyhow::{anyhow, Result};
use futures_util::FutureExt;
use speedrun_common::{CostRecord, Offer, RunResult, SpeedrunError};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::time::Instant;

use crate::cancel::{until_cancelled, CancelSignal};
use crate::catalog::CatalogClient;
use crate::deploy::DeploymentDriver;
use crate::finops;
use crate::lifecycle::LifecycleManager;

/// State of one run, threaded explicitly through the phases.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub started: Instant,
    pub offer: Offer,
    pub contract_id: u64,
}

/// Everything known about a run that got as far as renting an instance.
#[derive(Debug)]
pub struct RunReport {
    pub offer: Offer,
    pub contract_id: u64,
    pub destroyed: bool,
    pub cost: CostRecord,
    pub outcome: Result<RunResult>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub struct RunController {
    catalog: CatalogClient,
    lifecycle: LifecycleManager,
    driver: DeploymentDriver,
    cancel: CancelSignal,
}

impl RunController {
    pub fn new(
        catalog: CatalogClient,
        lifecycle: LifecycleManager,
        driver: DeploymentDriver,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            catalog,
            lifecycle,
            driver,
            cancel,
        }
    }

    /// Offer search only; nothing is rented.
    pub async fn dry_run(&self) -> Result<Offer> {
        until_cancelled(&self.cancel, self.catalog.select_best_offer()).await
    }

    /// Full run. Errors before an instance exists come back as `Err`; once
    /// an instance was created the result is always a report whose
    /// `outcome` carries the remote phase's result.
    pub async fn run(&self, project_dir: &Path) -> Result<RunReport> {
        let started = Instant::now();

        let offer = until_cancelled(&self.cancel, self.catalog.select_best_offer()).await?;
        if self.cancel.is_cancelled() {
            return Err(SpeedrunError::Cancelled.into());
        }

        // Not cancellable: an interrupted create could leave a contract we never learn about.
        let contract_id = self.lifecycle.create(offer.id).await?;

        let ctx = RunContext {
            started,
            offer,
            contract_id,
        };
        tracing::info!(contract_id, offer_id = ctx.offer.id, "instance rented");

        let outcome = self.remote_phase(&ctx, project_dir).await;
        if let Err(e) = &outcome {
            tracing::warn!(contract_id, error = %format!("{:#}", e), "remote phase failed");
        }

        let destroyed = self.lifecycle.destroy(contract_id).await;

        let cost = finops::compute_cost(ctx.started.elapsed(), ctx.offer.price_per_hour);
        finops::report_cost(contract_id, &cost);

        Ok(RunReport {
            offer: ctx.offer,
            contract_id,
            destroyed,
            cost,
            outcome,
        })
    }

    /// Wait for readiness, deploy, run and collect. Panics and cancellation
    /// are turned into errors so the caller always reaches destroy. The
    /// driver observes cancellation itself so it can close its session.
    async fn remote_phase(&self, ctx: &RunContext, project_dir: &Path) -> Result<RunResult> {
        let work = async {
            let instance =
                until_cancelled(&self.cancel, self.lifecycle.await_running(ctx.contract_id)).await?;
            self.driver.deploy(&instance, project_dir).await
        };

        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(anyhow!("remote phase panicked: {}", panic_message(panic.as_ref()))),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
