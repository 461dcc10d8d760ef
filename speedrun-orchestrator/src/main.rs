//! `speedrun` - run a `train.py` project on the most powerful rentable
//! multi-GPU machine, bring the model files back and tear the machine down.

use anyhow::Result;
use clap::Parser;
use speedrun_common::SpeedrunError;
use speedrun_orchestrator::{build_controller, CancelHandle, CancelSignal, Settings};
use speedrun_providers::ssh::SshTransport;
use speedrun_providers::vastai::VastAiMarketplace;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "speedrun")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a training project on a rented multi-GPU machine", long_about = None)]
struct Cli {
    /// Project directory containing train.py
    project: PathBuf,

    /// Only search for GPUs, do not create instances
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    dotenv::dotenv().ok();
    init_tracing();

    std::process::exit(run(cli).await);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns the process exit code.
async fn run(cli: Cli) -> i32 {
    let project = match check_project(&cli.project) {
        Ok(p) => p,
        Err(msg) => {
            println!("Error: {}", msg);
            return 1;
        }
    };

    let settings = match Settings::from_env() {
        Ok(s) => s,
        Err(e) => {
            println!("Error: {}", e);
            return 1;
        }
    };

    let name = project
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| project.display().to_string());
    println!("\n🚀 Starting speedrun for: {}", name);
    if cli.dry_run {
        println!("🔍 DRY RUN MODE - will only search for GPUs, not create instances");
    }
    println!("{}", "=".repeat(50));

    let (handle, cancel) = CancelSignal::channel();
    spawn_interrupt_listener(handle);

    let marketplace = Arc::new(VastAiMarketplace::new(
        settings.vastai_bin.clone(),
        settings.api_key.clone(),
    ));
    let transport = Arc::new(SshTransport::new(
        settings.ssh.user.clone(),
        settings.ssh.identity_file.clone(),
        settings.ssh.connect_timeout,
    ));
    let controller = build_controller(&settings, marketplace, transport, cancel);

    if cli.dry_run {
        return match controller.dry_run().await {
            Ok(_) => {
                println!("\n✅ Dry run completed - speedrun is working!");
                0
            }
            Err(e) => {
                println!("\n❌ Dry run failed: {:#}", e);
                1
            }
        };
    }

    match controller.run(&project).await {
        Ok(report) => match &report.outcome {
            Ok(result) => {
                tracing::info!(
                    contract_id = report.contract_id,
                    artifacts = result.artifacts.len(),
                    "run finished"
                );
                println!("\n✨ Speedrun completed!");
                0
            }
            Err(e) => {
                report_failure(e);
                1
            }
        },
        Err(e) => {
            report_failure(&e);
            1
        }
    }
}

/// Resolve the project path and check it holds an entry point.
fn check_project(path: &Path) -> Result<PathBuf, String> {
    let resolved = match std::fs::canonicalize(path) {
        Ok(p) if p.is_dir() => p,
        _ => return Err(format!("'{}' is not a valid directory", path.display())),
    };
    if !resolved.join(speedrun_orchestrator::deploy::ENTRY_POINT).is_file() {
        return Err("No train.py found in project directory".to_string());
    }
    Ok(resolved)
}

fn report_failure(e: &anyhow::Error) {
    println!("\n{}", failure_line(e));
}

fn failure_line(e: &anyhow::Error) -> String {
    match e.downcast_ref::<SpeedrunError>() {
        Some(SpeedrunError::JobFailed { exit_code }) => {
            format!("❌ Training failed (exit code {})", exit_code)
        }
        Some(SpeedrunError::Cancelled) => "🛑 Speedrun cancelled".to_string(),
        _ => format!("❌ Speedrun failed: {:#}", e),
    }
}

/// First Ctrl-C cancels the run and lets cleanup finish; a second one exits
/// immediately.
fn spawn_interrupt_listener(handle: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        println!("\n⚠️ Interrupt received, destroying instance before exit (Ctrl-C again to force)");
        handle.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            println!("⚠️ Forced exit, check `vastai show instances` for leftovers");
            std::process::exit(130);
        }
    });
}
