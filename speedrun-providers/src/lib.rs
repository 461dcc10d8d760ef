use anyhow::Result;
use async_trait::async_trait;
use speedrun_common::{Instance, Offer};

pub mod transport;

pub use transport::{ExecOutput, RemoteProcess, RemoteSession, RemoteTransport};

/// GPU marketplace backend: offer search plus the instance lifecycle calls.
#[async_trait]
pub trait Marketplace: Send + Sync {
    /// Search rentable offers. Ordering is done by the backend and must be
    /// preserved: callers treat the first element as the best candidate.
    async fn search_offers(&self, query: &inventory::OfferQuery) -> Result<Vec<Offer>>;

    /// Rent an offer. Returns the contract id of the new instance.
    async fn create_instance(&self, spec: &inventory::LaunchSpec) -> Result<u64>;

    async fn list_instances(&self) -> Result<Vec<Instance>>;

    async fn destroy_instance(&self, contract_id: u64) -> Result<()>;
}

pub mod inventory {
    #[derive(Clone, Debug, PartialEq)]
    pub struct OfferQuery {
        /// Backend filter expression, e.g. `rentable=true num_gpus>=4`.
        pub filter: String,
        /// Backend ordering expression, e.g. `num_gpus-,gpu_total_ram-`.
        pub order: String,
        pub limit: u32,
    }

    #[derive(Clone, Debug, PartialEq)]
    pub struct LaunchSpec {
        pub offer_id: u64,
        pub image: String,
        pub disk_gb: u32,
        pub label: String,
    }
}

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "ssh")]
pub mod ssh;

#[cfg(feature = "vastai")]
pub mod vastai;
