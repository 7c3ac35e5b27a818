//! Outbox relay worker: the background loop that moves rows out of the
//! outbox table and onto the broker.
//!
//! Claim batch (select + mark-pending in one transaction), publish, mark
//! sent — the claim transaction never spans the broker round trip, so a
//! slow broker cannot turn into a stalled database; it only has to hold the
//! row lock across the local select-then-update.

use std::time::Duration;

use chrono::Duration as ChronoDuration;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerMessage};
use crate::outbox::{OutboxError, OutboxStore};

/// Errors surfaced by one relay pass. A pass that errors does not stop the
/// worker; it logs and waits for the next tick.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error("broker error: {0}")]
    Broker(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Tunables for the relay loop.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub batch_size: u32,
    pub poll_interval: Duration,
    /// Rows left `pending` by a relay that died mid-claim are reset back to
    /// `init` once they are older than this.
    pub stale_pending_after: ChronoDuration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            stale_pending_after: ChronoDuration::seconds(30),
        }
    }
}

/// Drives one outbox store's rows onto one broker. Generic over the sqlx
/// backend so the same loop runs against either the `postgres` or `sqlite`
/// store, matching the associated-`Conn` pattern used everywhere else.
pub struct RelayWorker<DB, O, B>
where
    DB: sqlx::Database,
    O: OutboxStore<Conn = DB::Connection>,
    B: Broker,
{
    pool: sqlx::Pool<DB>,
    store: O,
    broker: B,
    config: RelayConfig,
}

impl<DB, O, B> RelayWorker<DB, O, B>
where
    DB: sqlx::Database,
    O: OutboxStore<Conn = DB::Connection>,
    B: Broker,
{
    pub fn new(pool: sqlx::Pool<DB>, store: O, broker: B) -> Self {
        Self {
            pool,
            store,
            broker,
            config: RelayConfig::default(),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Recover rows stranded `pending` by a relay instance that crashed
    /// between claiming them and marking them `sent`. Call once at
    /// worker startup, before the first `run_once`.
    pub async fn recover_stale(&self) -> Result<u64, RelayError> {
        let mut conn = self.pool.acquire().await.map_err(|e| RelayError::Database(e.to_string()))?;
        let reset = self
            .store
            .reset_stale_pending(&mut conn, self.config.stale_pending_after)
            .await?;
        if reset > 0 {
            warn!(rows = reset, "recovered stale pending outbox rows on startup");
        }
        Ok(reset)
    }

    /// Run the poll loop forever. Intended to be spawned as its own task.
    pub async fn run(&self) {
        if let Err(e) = self.recover_stale().await {
            error!(error = %e, "failed to recover stale pending rows, continuing anyway");
        }

        loop {
            match self.run_once().await {
                Ok(0) => tokio::time::sleep(self.config.poll_interval).await,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "relay pass failed, will retry next tick");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
    }

    /// One claim → publish → mark-sent pass. Returns the number of rows
    /// moved (0 means the outbox was empty, the caller should back off).
    pub async fn run_once(&self) -> Result<usize, RelayError> {
        let mut claim_tx = self.pool.begin().await.map_err(|e| RelayError::Database(e.to_string()))?;
        let rows = self.store.get_not_sent(&mut *claim_tx, self.config.batch_size).await?;
        if rows.is_empty() {
            claim_tx.commit().await.map_err(|e| RelayError::Database(e.to_string()))?;
            return Ok(0);
        }

        let ids: Vec<_> = rows.iter().map(|r| r.id).collect();
        // Read and claim happen in the same transaction, so no other relay
        // instance can read these rows as `init` between this pass's select
        // and its update. Once this commits, the rows are ours; it's safe
        // to publish outside a transaction from here.
        self.store.batch_mark_as_pending(&mut *claim_tx, &ids).await?;
        claim_tx.commit().await.map_err(|e| RelayError::Database(e.to_string()))?;

        let messages: Vec<BrokerMessage> = rows
            .iter()
            .map(|r| BrokerMessage::new(r.topic.clone(), r.key.clone(), r.payload.clone()))
            .collect();

        match self.broker.publish_batch(messages).await {
            Ok(()) => {
                let mut conn = self.pool.acquire().await.map_err(|e| RelayError::Database(e.to_string()))?;
                self.store.batch_mark_as_sent(&mut conn, &ids).await?;
                info!(count = ids.len(), "relayed outbox rows");
                Ok(ids.len())
            }
            Err(e) => {
                // Leave the rows `pending`: the crash-recovery sweep will
                // reset them to `init` for a fresh claim if this instance
                // never recovers, so no separate retry-count bookkeeping is
                // needed here.
                warn!(error = %e, count = ids.len(), "broker publish failed, rows remain pending for recovery");
                Err(RelayError::Broker(e.to_string()))
            }
        }
    }
}
