// src/models/mod.rs

//! Domain models for the catalog crawler and mirror distributor.
//!
//! This module contains all data structures used throughout the application,
//! organized by their primary purpose.

mod catalog;
mod config;
pub(crate) mod entry;
mod mirror;
mod outcome;
mod range;

// Re-export all public types
pub use catalog::{Catalog, IndexEntry, MatchRule};
pub use config::{
    Config, CrawlerConfig, LoggingConfig, MirrorConfig, NotifyConfig, StateConfig, TargetConfig,
};
pub use entry::{
    CATALOG_SOURCE, CatalogEntry, CatalogRecord, DEFAULT_THEME_COLOR, MergeOutcome, OriginRef,
    Point,
};
pub use mirror::{
    DestinationId, FolderRange, FolderRangePolicy, MirrorMode, MirrorTarget, PolicyRule,
    StoredPolicy,
};
pub use outcome::{
    DestinationOutcome, DestinationReport, DistributionReport, PartialReason, RejectReason,
    Rejection, RunStatus, ScanResult, ScanStatus, SyncResult,
};
pub use range::{CoverageSet, IdRange, ScanCursor};
