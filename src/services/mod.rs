//! Service layer: the external collaborators of a run.
//!
//! - Catalog lookups (`CatalogApi`, `HttpCatalog`)
//! - Global request spacing (`RateLimiter`)
//! - Status notifications (`Notifier`, `BarkNotifier`)
//! - Mirror repositories (`MirrorRemote`, `GitRemote`)

mod catalog;
mod limiter;
pub mod notifier;
mod remote;

pub use catalog::{CatalogApi, HttpCatalog, parse_points, record_from_lite};
pub use limiter::RateLimiter;
pub use notifier::{BarkNotifier, NoopNotifier, Notifier, Severity};
pub use remote::{GitRemote, MirrorRemote};
