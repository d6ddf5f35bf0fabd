pub mod driver;
pub mod types;

pub use driver::{store_from_config, BatchDriver};
pub use types::{BatchSummary, EnrichmentResult, ItemOutcome, ItemState};
