use anyhow::Result;
use speedrun_common::{Offer, SpeedrunError};
use speedrun_providers::inventory::OfferQuery;
use speedrun_providers::Marketplace;
use std::sync::Arc;

use crate::settings::SearchPolicy;

const ORDER_BY_GPUS_THEN_MEMORY: &str = "num_gpus-,gpu_total_ram-";
const ORDER_BY_MEMORY: &str = "gpu_total_ram-";

/// One step of the offer-search fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchTier {
    pub description: &'static str,
    pub query: OfferQuery,
}

/// The fallback ladder, most demanding first. The backend's ordering is the
/// whole definition of "best": more GPUs, then more total GPU memory.
pub fn search_tiers(policy: &SearchPolicy) -> Vec<SearchTier> {
    let base = format!("rentable=true reliability>{}", policy.min_reliability);
    let tier = |description: &'static str, extra: Option<String>, order: &str| SearchTier {
        description,
        query: OfferQuery {
            filter: match extra {
                Some(extra) => format!("{} {}", base, extra),
                None => base.clone(),
            },
            order: order.to_string(),
            limit: policy.limit,
        },
    };

    vec![
        tier(
            "affordable 4+ GPU instances",
            Some(format!("num_gpus>=4 dph_total<{}", policy.max_price_per_hour)),
            ORDER_BY_GPUS_THEN_MEMORY,
        ),
        tier(
            "any 4+ GPU instances",
            Some("num_gpus>=4".to_string()),
            ORDER_BY_GPUS_THEN_MEMORY,
        ),
        tier(
            "2+ GPU instances",
            Some("num_gpus>=2".to_string()),
            ORDER_BY_GPUS_THEN_MEMORY,
        ),
        tier("single GPU instances", None, ORDER_BY_MEMORY),
    ]
}

pub struct CatalogClient {
    marketplace: Arc<dyn Marketplace>,
    policy: SearchPolicy,
}

impl CatalogClient {
    pub fn new(marketplace: Arc<dyn Marketplace>, policy: SearchPolicy) -> Self {
        Self { marketplace, policy }
    }

    /// Walk the tiers in order and take the first candidate of the first
    /// non-empty tier. Later tiers are not queried once one returns offers.
    pub async fn select_best_offer(&self) -> Result<Offer> {
        println!("🔍 Finding most powerful multi-GPU instance on vast.ai...");

        for (idx, tier) in search_tiers(&self.policy).into_iter().enumerate() {
            if idx > 0 {
                println!("🔍 Nothing found, searching for {}...", tier.description);
            }
            let offers = self.marketplace.search_offers(&tier.query).await?;
            tracing::debug!(
                tier = idx + 1,
                filter = %tier.query.filter,
                candidates = offers.len(),
                "offer search"
            );

            if let Some(best) = offers.into_iter().next() {
                println!("✅ Selected: {}", best.summary());
                return Ok(best);
            }
        }

        Err(SpeedrunError::NoResourceAvailable.into())
    }
}
