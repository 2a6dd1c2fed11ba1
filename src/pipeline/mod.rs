//! Pipeline entry points.
//!
//! - `Crawler::scan`: resumable range scan of the catalog API into the store
//! - `plan`: assign store folders to partitioned mirror destinations
//! - `run_mirror`: diff and push store content to every mirror
//! - `prune_origins`: drop redundant provenance refs

pub mod circuit_breaker;
pub mod diff;
pub mod distribute;
pub mod plan;
pub mod prune;
pub mod scan;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerResult};
pub use diff::{DiffCalculator, Manifest, ManifestDiff, build_manifest, calculate_diff};
pub use distribute::{Distributor, MIRROR_DATA_PREFIX, run_mirror};
pub use plan::{covers_all_destinations, default_policy, even_split, plan};
pub use prune::{PruneReport, prune_origins};
pub use scan::{Crawler, ScanOptions};
