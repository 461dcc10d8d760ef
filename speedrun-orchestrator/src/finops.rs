use speedrun_common::CostRecord;
use std::time::Duration;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Rental cost of `elapsed` wall-clock time at `price_per_hour`.
pub fn compute_cost(elapsed: Duration, price_per_hour: f64) -> CostRecord {
    let hours = elapsed.as_secs_f64() / SECONDS_PER_HOUR;
    CostRecord {
        elapsed,
        price_per_hour,
        total: hours * price_per_hour,
    }
}

pub fn format_cost(cost: &CostRecord) -> String {
    format!("💰 Total cost: ${:.2}", cost.total)
}

pub fn report_cost(contract_id: u64, cost: &CostRecord) {
    println!("{}", format_cost(cost));
    tracing::info!(
        contract_id,
        elapsed_s = cost.elapsed.as_secs(),
        price_per_hour = cost.price_per_hour,
        total = cost.total,
        "run cost"
    );
}
