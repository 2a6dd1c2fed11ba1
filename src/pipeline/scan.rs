// src/pipeline/scan.rs

//! Incremental, resumable range scan over the catalog API.
//!
//! Lookups run on a bounded, order-preserving worker pool behind one shared
//! rate limiter. A single writer consumes results in id order, merges them
//! into the catalog, advances the cursor and flushes every batch, store
//! first and cursor second.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{StreamExt, future, stream};

use crate::error::{AppError, Result};
use crate::models::{
    Catalog, CatalogRecord, CoverageSet, CrawlerConfig, IdRange, MergeOutcome, PartialReason,
    RejectReason, Rejection, ScanCursor, ScanResult, ScanStatus,
};
use crate::pipeline::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::services::{CatalogApi, RateLimiter};
use crate::storage::{RecordStore, ScanState};
use crate::utils::log;

/// Tunables for one scan run.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub range: IdRange,
    /// Lookups per second across all workers; 0 is unlimited
    pub rate_limit: f64,
    /// Retries after a transient failure
    pub max_wait_attempts: u32,
    pub budget: Duration,
    pub workers: usize,
    pub batch_size: usize,
    pub max_api_failures: u32,
    pub aggressive: bool,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl ScanOptions {
    pub fn from_config(config: &CrawlerConfig, range: IdRange) -> Self {
        Self {
            range,
            rate_limit: config.rate_limit,
            max_wait_attempts: config.max_wait_attempts,
            budget: config.budget(),
            workers: config.max_concurrent,
            batch_size: config.batch_size,
            max_api_failures: config.max_api_failures,
            aggressive: config.aggressive_matching,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_retry_delay: Duration::from_millis(config.max_retry_delay_ms),
        }
    }
}

/// Final state of one lookup after retries.
#[derive(Debug)]
enum Lookup {
    Found(CatalogRecord),
    NotFound,
    Failed(AppError),
}

/// Retry policy shared by the worker pool and the writer's group lookups.
#[derive(Clone)]
struct Fetcher {
    api: Arc<dyn CatalogApi>,
    limiter: Arc<RateLimiter>,
    retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Fetcher {
    async fn lookup(&self, id: u64) -> Lookup {
        let mut delay = self.base_delay;
        let mut attempt = 0;
        loop {
            match self.api.lookup(id, &self.limiter).await {
                Ok(Some(record)) => return Lookup::Found(record),
                Ok(None) => return Lookup::NotFound,
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    ::log::debug!(
                        "id {id}: transient failure ({e}), retry {attempt}/{} in {:?}",
                        self.retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(e) => return Lookup::Failed(e),
            }
        }
    }
}

/// Range scanner.
pub struct Crawler {
    fetcher: Fetcher,
    options: ScanOptions,
}

impl Crawler {
    pub fn new(api: Arc<dyn CatalogApi>, options: ScanOptions) -> Self {
        let fetcher = Fetcher {
            api,
            limiter: Arc::new(RateLimiter::per_second(options.rate_limit)),
            retries: options.max_wait_attempts,
            base_delay: options.retry_delay,
            max_delay: options.max_retry_delay.max(options.retry_delay),
        };
        Self { fetcher, options }
    }

    pub fn options(&self) -> &ScanOptions {
        &self.options
    }

    /// Scan every id of the range not covered by an earlier run and merge what is found.
    pub async fn scan(&self, store: &dyn RecordStore, state: &ScanState) -> Result<ScanResult> {
        let range = self.options.range;
        let mut cursor = state.load().await?;
        let Some(begin) = cursor.resume_point(range) else {
            ::log::info!(
                "Nothing to scan: [{}, {}) is already covered",
                range.start,
                range.end
            );
            return Ok(ScanResult::nothing_to_do(cursor));
        };

        cursor.attempt += 1;
        log::header(&format!("Scanning ids [{begin}, {})", range.end));
        log::sub_item(&format!(
            "workers={} rate={}/s retries={} budget={:?} aggressive={}",
            self.options.workers.max(1),
            self.options.rate_limit,
            self.options.max_wait_attempts,
            self.options.budget,
            self.options.aggressive
        ));

        let catalog = store.load_catalog().await?;
        let mut writer = Writer::new(store, state, catalog, cursor, &self.options);

        let deadline = writer.deadline;
        let breaker = Arc::clone(&writer.breaker);
        let skip = Arc::clone(&writer.skip);
        let stopped = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stopped);
        let fetcher = self.fetcher.clone();

        let lookups = stream::iter(begin..range.end)
            .take_while(move |_| {
                let go = !breaker.is_tripped() && within(deadline);
                if !go {
                    stop_flag.store(true, Ordering::SeqCst);
                }
                future::ready(go)
            })
            .filter(move |id| {
                // Poisoning only happens if the writer panicked; dispatching anyway is harmless.
                let covered = skip.lock().map(|s| s.contains(*id)).unwrap_or(false);
                future::ready(!covered)
            })
            .map(move |id| {
                let fetcher = fetcher.clone();
                async move { (id, fetcher.lookup(id).await) }
            })
            .buffered(self.options.workers.max(1));
        let mut lookups = std::pin::pin!(lookups);

        while let Some((id, lookup)) = lookups.next().await {
            writer.apply(id, lookup, &self.fetcher).await?;
        }

        let status = if stopped.load(Ordering::SeqCst) {
            let reason = if writer.breaker.is_tripped() {
                PartialReason::ApiUnavailable
            } else {
                PartialReason::BudgetExceeded
            };
            ::log::warn!("Scan stopped early: {reason}");
            ScanStatus::Partial { reason }
        } else {
            writer.cursor.advance_to(range.end);
            ScanStatus::Completed
        };

        writer.flush().await?;
        Ok(writer.finish(status))
    }
}

fn within(deadline: Option<Instant>) -> bool {
    deadline.is_none_or(|d| Instant::now() < d)
}

/// The single writer: owns the catalog and cursor for the run.
struct Writer<'a> {
    store: &'a dyn RecordStore,
    state: &'a ScanState,
    catalog: Catalog,
    cursor: ScanCursor,
    range: IdRange,
    aggressive: bool,
    batch_size: usize,
    breaker: Arc<CircuitBreaker>,
    /// End of the wall-clock budget; `None` if it does not fit in an `Instant`
    deadline: Option<Instant>,
    /// Ids not to dispatch: covered before this run or by a group match
    skip: Arc<Mutex<CoverageSet>>,
    since_flush: usize,
    matched: Vec<u64>,
    grouped: Vec<u64>,
    rejected: Vec<Rejection>,
    empty: u64,
    created: BTreeSet<u32>,
    updated: BTreeSet<u32>,
}

impl<'a> Writer<'a> {
    fn new(
        store: &'a dyn RecordStore,
        state: &'a ScanState,
        catalog: Catalog,
        cursor: ScanCursor,
        options: &ScanOptions,
    ) -> Self {
        let skip = Arc::new(Mutex::new(cursor.covered.clone()));
        Self {
            store,
            state,
            catalog,
            cursor,
            range: options.range,
            aggressive: options.aggressive,
            batch_size: options.batch_size.max(1),
            breaker: Arc::new(CircuitBreaker::with_config(CircuitBreakerConfig {
                max_consecutive_failures: options.max_api_failures,
            })),
            deadline: Instant::now().checked_add(options.budget),
            skip,
            since_flush: 0,
            matched: Vec::new(),
            grouped: Vec::new(),
            rejected: Vec::new(),
            empty: 0,
            created: BTreeSet::new(),
            updated: BTreeSet::new(),
        }
    }

    async fn apply(&mut self, id: u64, lookup: Lookup, fetcher: &Fetcher) -> Result<()> {
        // Already settled by a group match while this lookup was in flight.
        if id < self.cursor.next_id && self.cursor.covered.contains(id) {
            ::log::debug!("id {id}: result discarded, covered by group");
            return Ok(());
        }

        let confirmed = self.settle(id, lookup);
        let mut next = id + 1;

        if self.aggressive
            && let Some(record) = confirmed.filter(|r| !r.group_key.is_empty())
        {
            next = self.expand_group(id, &record, fetcher).await + 1;
        }

        self.cursor.advance_to(next);
        self.since_flush += 1;
        if self.since_flush >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Record one lookup outcome. Returns the record when it was merged.
    fn settle(&mut self, id: u64, lookup: Lookup) -> Option<CatalogRecord> {
        match lookup {
            Lookup::Found(record) if !record.has_name() => {
                self.breaker.record_success();
                ::log::warn!("id {id}: record has no name, rejected");
                self.reject(id, RejectReason::NamelessRecord, "neither title nor localized name");
                self.cursor.mark(id, false);
                None
            }
            Lookup::Found(record) => {
                self.breaker.record_success();
                self.merge(id, &record);
                self.cursor.mark(id, false);
                Some(record)
            }
            Lookup::NotFound => {
                self.breaker.record_success();
                self.empty += 1;
                self.cursor.mark(id, false);
                None
            }
            Lookup::Failed(e) => {
                self.breaker.record_failure();
                let reason = if e.is_transient() {
                    RejectReason::Unresolved
                } else {
                    RejectReason::Fetch
                };
                ::log::warn!("id {id}: lookup failed ({e}), recorded as unresolved");
                self.reject(id, reason, &e.to_string());
                self.cursor.mark(id, true);
                None
            }
        }
    }

    fn merge(&mut self, id: u64, record: &CatalogRecord) {
        let (local_id, outcome) = self.catalog.upsert(record, self.aggressive, Utc::now());
        self.matched.push(id);
        match outcome {
            MergeOutcome::Created => {
                log::sub_item(&format!(
                    "+ {} (id {id}) -> new entry {local_id}",
                    record.display_name()
                ));
                self.created.insert(local_id);
            }
            MergeOutcome::Updated => {
                log::sub_item(&format!(
                    "~ {} (id {id}) merged into entry {local_id}",
                    record.display_name()
                ));
                if !self.created.contains(&local_id) {
                    self.updated.insert(local_id);
                }
            }
            MergeOutcome::Unchanged => {
                ::log::debug!("id {id}: entry {local_id} already up to date");
            }
        }
    }

    fn reject(&mut self, id: u64, reason: RejectReason, message: &str) {
        self.rejected.push(Rejection {
            id,
            reason,
            message: message.to_string(),
        });
    }

    /// Follow the record's declared related ids upward. Each related id that
    /// confirms the same group key is merged and the ids strictly between it
    /// and the previous confirmed id are covered without lookups. Stops at
    /// the first id that does not confirm. Returns the last confirmed id.
    async fn expand_group(&mut self, anchor: u64, record: &CatalogRecord, fetcher: &Fetcher) -> u64 {
        let related: BTreeSet<u64> = record
            .related_ids
            .iter()
            .copied()
            .filter(|&b| b > anchor && b < self.range.end && !self.cursor.covered.contains(b))
            .collect();

        let mut last = anchor;
        for b in related {
            if self.breaker.is_tripped() || !within(self.deadline) {
                ::log::debug!("Group '{}': expansion stopped at {b}", record.group_key);
                break;
            }
            let confirmed = match fetcher.lookup(b).await {
                Lookup::Found(other) if other.has_name() && other.group_key == record.group_key => {
                    self.breaker.record_success();
                    Some(other)
                }
                Lookup::Failed(_) => {
                    self.breaker.record_failure();
                    None
                }
                _ => {
                    self.breaker.record_success();
                    None
                }
            };
            let Some(other) = confirmed else {
                ::log::debug!("id {b}: group '{}' not confirmed, scanning normally", record.group_key);
                break;
            };

            let between: Vec<u64> = (last + 1..b)
                .filter(|&id| !self.cursor.covered.contains(id))
                .collect();
            self.cursor.mark_range(last + 1, b - 1);
            self.merge(b, &other);
            self.cursor.mark(b, false);
            if let Ok(mut skip) = self.skip.lock() {
                skip.insert_range(last + 1, b);
            }

            ::log::info!(
                "Group '{}': {} confirmed by {}, covered {} ids without lookup",
                record.group_key,
                anchor,
                b,
                between.len()
            );
            self.grouped.extend(between);
            last = b;
        }
        last
    }

    /// Persist dirty entries, then the cursor.
    async fn flush(&mut self) -> Result<()> {
        if self.catalog.has_pending() {
            let entries = self.catalog.take_dirty();
            self.store.save_entries(&entries).await?;
            self.store.write_index(&self.catalog).await?;
        }
        self.cursor.updated_at = Utc::now();
        self.state.save(&self.cursor).await?;
        self.since_flush = 0;
        Ok(())
    }

    fn finish(self, status: ScanStatus) -> ScanResult {
        log::summary(
            "Scan",
            &[
                ("status", format!("{status:?}")),
                ("next_id", self.cursor.next_id.to_string()),
                ("matched", log::id_list(&self.matched, 20)),
                ("grouped", self.grouped.len().to_string()),
                ("rejected", self.rejected.len().to_string()),
                ("not found", self.empty.to_string()),
                ("new entries", self.created.len().to_string()),
                ("updated entries", self.updated.len().to_string()),
            ],
        );
        ScanResult {
            status,
            matched: self.matched,
            grouped: self.grouped,
            rejected: self.rejected,
            empty: self.empty,
            created: self.created.into_iter().collect(),
            updated: self.updated.into_iter().collect(),
            cursor: self.cursor,
        }
    }
}
