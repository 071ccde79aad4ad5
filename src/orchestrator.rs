// ABOUTME: Sync orchestrator - drives the poll/materialize cycle
// ABOUTME: Primary poll, snapshot, concurrent secondary polls, materialize, notify

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use reqwest::Client;
use tokio::sync::broadcast;

use crate::aggregator::TransactionBuffer;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::fetcher::{ChangeFetcher, FetcherRole};
use crate::materializer::Materializer;
use crate::protocol::TxId;
use crate::rollback::{RollbackHandle, RollbackReport};
use crate::schema::SchemaCache;
use crate::store::LocalStore;
use crate::utils::Backoff;

/// Receives a notification after every cycle that materialized something.
///
/// `on_change` runs on the blocking thread pool, so it may query the store.
pub trait ChangeObserver: Send + Sync {
    fn on_change(&self, stats: &CycleStats);
}

/// Logs the row count of each watched table.
pub struct LoggingObserver {
    store: LocalStore,
    tables: Vec<String>,
}

impl LoggingObserver {
    pub fn new(store: LocalStore, tables: Vec<String>) -> Self {
        Self { store, tables }
    }
}

impl ChangeObserver for LoggingObserver {
    fn on_change(&self, stats: &CycleStats) {
        let counts: Vec<String> = self
            .tables
            .iter()
            .map(|table| match self.store.count_rows(table) {
                Ok(n) => format!("{}={}", table, n),
                Err(_) => format!("{}=?", table),
            })
            .collect();
        tracing::info!(
            "Local store changed ({} transaction(s)): {}",
            stats.transactions_materialized,
            counts.join(", ")
        );
    }
}

/// How the primary poll of a cycle went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryPoll {
    #[default]
    Succeeded,
    /// Polling was paused because the aggregator is full.
    Skipped,
    Failed {
        retryable: bool,
    },
}

/// Statistics from one orchestrator cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleStats {
    pub transactions_materialized: usize,
    pub events_received: usize,
    pub poll_errors: usize,
    pub primary: PrimaryPoll,
    /// Failed secondary polls, and how many of those retrying will not fix.
    pub secondary_errors: usize,
    pub secondary_fatal_errors: usize,
    pub materialization_failed: bool,
    /// Unconfirmed local events discarded by the failure path.
    pub rolled_back: usize,
    pub duration_ms: u64,
}

impl CycleStats {
    pub fn is_success(&self) -> bool {
        self.poll_errors == 0 && !self.materialization_failed
    }

    /// Whether any poll failed this cycle and, if so, whether every failure
    /// was retryable.
    pub fn transport_failure(&self) -> Option<bool> {
        let primary = match self.primary {
            PrimaryPoll::Failed { retryable } => Some(retryable),
            PrimaryPoll::Succeeded | PrimaryPoll::Skipped => None,
        };
        if primary.is_none() && self.secondary_errors == 0 {
            return None;
        }
        Some(primary.unwrap_or(true) && self.secondary_fatal_errors == 0)
    }

    fn absorb(&mut self, other: &CycleStats) {
        self.transactions_materialized += other.transactions_materialized;
        self.events_received += other.events_received;
        self.poll_errors += other.poll_errors;
        self.secondary_errors += other.secondary_errors;
        self.secondary_fatal_errors += other.secondary_fatal_errors;
        self.materialization_failed |= other.materialization_failed;
        self.rolled_back += other.rolled_back;
        self.duration_ms += other.duration_ms;
        self.primary = other.primary;
    }
}

#[derive(Debug, Clone)]
struct Pacing {
    min_cycle_interval: Duration,
    max_pending: usize,
}

/// Owns the fetchers, the shared aggregator and the materializer.
///
/// The first configured shape is the primary: it is polled first each cycle
/// and decides what gets materialized. The remaining shapes are polled
/// concurrently afterwards.
pub struct SyncOrchestrator {
    primary: ChangeFetcher,
    secondaries: Vec<ChangeFetcher>,
    buffer: TransactionBuffer,
    schemas: SchemaCache,
    materializer: Materializer,
    rollback: Option<RollbackHandle>,
    observer: Option<Arc<dyn ChangeObserver>>,
    pacing: Pacing,
    backoff: Backoff,
}

impl SyncOrchestrator {
    pub fn new(
        config: &SyncConfig,
        store: LocalStore,
        rollback: Option<RollbackHandle>,
    ) -> SyncResult<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(SyncError::from_request)?;

        let schemas = SchemaCache::new();
        let buffer = TransactionBuffer::new();

        let mut fetchers = config
            .shapes
            .iter()
            .enumerate()
            .map(|(idx, shape)| {
                let role = if idx == 0 {
                    FetcherRole::Primary
                } else {
                    FetcherRole::Secondary
                };
                ChangeFetcher::new(
                    shape.clone(),
                    role,
                    &config.shape_url,
                    client.clone(),
                    schemas.clone(),
                    buffer.clone(),
                )
            })
            .collect::<SyncResult<Vec<_>>>()?;
        if fetchers.is_empty() {
            return Err(SyncError::Config("no shapes configured".to_string()));
        }
        let primary = fetchers.remove(0);

        let materializer = Materializer::new(
            store,
            schemas.clone(),
            buffer.clone(),
            config.event_column.clone(),
            config.integrity,
        )?;

        Ok(Self {
            primary,
            secondaries: fetchers,
            buffer,
            schemas,
            materializer,
            rollback,
            observer: None,
            pacing: Pacing {
                min_cycle_interval: config.min_cycle_interval(),
                max_pending: config.max_pending_transactions,
            },
            backoff: Backoff::new(config.backoff_initial(), config.backoff_max()),
        })
    }

    pub fn with_observer(mut self, observer: Arc<dyn ChangeObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn buffer(&self) -> &TransactionBuffer {
        &self.buffer
    }

    pub fn schemas(&self) -> &SchemaCache {
        &self.schemas
    }

    pub fn primary(&self) -> &ChangeFetcher {
        &self.primary
    }

    pub fn secondaries(&self) -> &[ChangeFetcher] {
        &self.secondaries
    }

    /// Every fetcher reached the head of its log and nothing is left to apply.
    pub fn is_caught_up(&self) -> bool {
        self.primary.cursor().is_live()
            && self.secondaries.iter().all(ChangeFetcher::is_caught_up)
            && self.buffer.is_empty()
    }

    /// Execute one cycle.
    pub async fn run_once(&mut self) -> CycleStats {
        let start = Instant::now();
        let mut stats = CycleStats::default();

        let snapshot = if self.buffer.len() >= self.pacing.max_pending {
            tracing::error!(
                "{} transactions waiting to be materialized (limit {}), pausing polls",
                self.buffer.len(),
                self.pacing.max_pending
            );
            stats.primary = PrimaryPoll::Skipped;
            self.buffer.snapshot()
        } else {
            match self.primary.poll().await {
                Ok(outcome) => stats.events_received += outcome.events,
                Err(e) => {
                    tracing::warn!("Primary poll of {} failed: {}", self.primary.shape(), e);
                    stats.poll_errors += 1;
                    stats.primary = PrimaryPoll::Failed {
                        retryable: e.is_retryable(),
                    };
                }
            }

            // Only transactions visible after the primary poll are applied this cycle
            let snapshot = self.buffer.snapshot();

            let results = join_all(self.secondaries.iter_mut().map(|f| f.poll())).await;
            for (fetcher, result) in self.secondaries.iter().zip(results) {
                match result {
                    Ok(outcome) => stats.events_received += outcome.events,
                    Err(e) => {
                        tracing::warn!("Poll of {} failed: {}", fetcher.shape(), e);
                        stats.poll_errors += 1;
                        stats.secondary_errors += 1;
                        if !e.is_retryable() {
                            stats.secondary_fatal_errors += 1;
                        }
                    }
                }
            }
            snapshot
        };

        if !snapshot.is_empty() {
            self.materialize(&snapshot, &mut stats).await;
            self.notify(&stats).await;
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        tracing::debug!(
            materialized = stats.transactions_materialized,
            events = stats.events_received,
            errors = stats.poll_errors,
            pending = self.buffer.len(),
            "Cycle complete in {}ms",
            stats.duration_ms
        );
        stats
    }

    async fn materialize(&mut self, snapshot: &[TxId], stats: &mut CycleStats) {
        let materializer = self.materializer.clone();
        let txids = snapshot.to_vec();
        let result = tokio::task::spawn_blocking(move || materializer.materialize(&txids)).await;

        let failure = match result {
            Ok(Ok(report)) => {
                stats.transactions_materialized = report.committed.len();
                return;
            }
            Ok(Err(e)) => {
                if let SyncError::Materialization { committed, .. } = &e {
                    stats.transactions_materialized = committed.len();
                }
                e.to_string()
            }
            Err(join_err) => format!("materializer task failed: {}", join_err),
        };

        stats.materialization_failed = true;
        tracing::error!("Materialization failed, discarding unconfirmed local writes: {}", failure);
        if let Some(report) = self.discard_unconfirmed().await {
            stats.rolled_back = report.events_discarded;
        }
    }

    async fn notify(&self, stats: &CycleStats) {
        let Some(observer) = self.observer.clone() else {
            return;
        };
        let stats = stats.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || observer.on_change(&stats)).await {
            tracing::error!("Change observer failed: {}", e);
        }
    }

    /// Failure path: undo local writes that the log has not confirmed.
    async fn discard_unconfirmed(&self) -> Option<RollbackReport> {
        let Some(handle) = self.rollback.clone() else {
            tracing::warn!("No rollback ledger installed; local writes left in place");
            return None;
        };
        match tokio::task::spawn_blocking(move || handle.rollback()).await {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                tracing::error!("Rollback failed: {}", e);
                None
            }
            Err(e) => {
                tracing::error!("Rollback task failed: {}", e);
                None
            }
        }
    }

    /// Delay before the next cycle, feeding every poll failure into the backoff.
    fn next_delay(&mut self, stats: &CycleStats, elapsed: Duration) -> Duration {
        let backoff = match stats.transport_failure() {
            Some(true) => self.backoff.record_failure(),
            Some(false) => self.backoff.record_permanent_failure(),
            None => {
                self.backoff.reset();
                Duration::ZERO
            }
        };
        if backoff > Duration::ZERO {
            tracing::warn!(
                "Backing off for {:?} after {} consecutive failure(s)",
                backoff,
                self.backoff.consecutive_failures()
            );
        }
        backoff.max(self.pacing.min_cycle_interval.saturating_sub(elapsed))
    }

    /// Cycle until every shape has caught up and the aggregator is drained,
    /// or `max_cycles` have run.
    pub async fn run_until_caught_up(&mut self, max_cycles: usize) -> CycleStats {
        let mut total = CycleStats::default();
        for cycle in 1..=max_cycles {
            let started = Instant::now();
            let stats = self.run_once().await;
            total.absorb(&stats);
            if self.is_caught_up() {
                tracing::info!("Caught up after {} cycle(s)", cycle);
                return total;
            }
            let delay = self.next_delay(&stats, started.elapsed());
            tokio::time::sleep(delay).await;
        }
        tracing::warn!("Not caught up after {} cycle(s)", max_cycles);
        total
    }

    /// Run cycles until a shutdown signal arrives.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> SyncResult<()> {
        tracing::info!(
            "Starting sync: primary {}, {} secondary shape(s)",
            self.primary.shape(),
            self.secondaries.len()
        );
        let mut cycles = 0u64;

        loop {
            let started = Instant::now();
            let stats = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping sync");
                    break;
                }
                stats = self.run_once() => stats,
            };
            cycles += 1;

            if stats.transactions_materialized > 0 || !stats.is_success() {
                tracing::info!(
                    "Cycle {}: {} transaction(s), {} event(s), {} poll error(s) in {}ms",
                    cycles,
                    stats.transactions_materialized,
                    stats.events_received,
                    stats.poll_errors,
                    stats.duration_ms
                );
            }

            let delay = self.next_delay(&stats, started.elapsed());
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping sync");
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(
            "Sync stopped after {} cycle(s), {} transaction(s) pending",
            cycles,
            self.buffer.len()
        );
        Ok(())
    }
}
