use chrono::Utc;
use pulse_autonomy::Backoff;
use pulse_core::{Checkpoint, Result, RuntimeState, RuntimeStore, TickId, WorkingSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Loads and persists the tick loop's checkpoint.
///
/// A checkpoint that could not be written is kept here and retried on the
/// next tick, so the store always holds the last committed version and the
/// loop never loses the newer one.
pub struct WorkingSetStore {
    store: Arc<dyn RuntimeStore>,
    attempts: u32,
    backoff: Backoff,
    pending: Option<Checkpoint>,
}

impl WorkingSetStore {
    pub fn new(store: Arc<dyn RuntimeStore>, retries: u32) -> Self {
        Self {
            store,
            attempts: retries.max(1),
            backoff: Backoff::new(
                Duration::from_millis(50),
                2.0,
                Duration::from_secs(2),
                0.1,
            ),
            pending: None,
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Last committed state and working set, or `initial` and an empty set on first run.
    pub fn load(&self, initial: RuntimeState) -> Result<(RuntimeState, WorkingSet)> {
        match self.store.load_checkpoint()? {
            Some(cp) => {
                info!(
                    state = %cp.state,
                    tick_id = %cp.tick_id,
                    tasks = cp.working_set.task_count(),
                    "restored checkpoint"
                );
                Ok((cp.state, cp.working_set))
            }
            None => {
                info!(state = %initial, "no checkpoint found, starting fresh");
                Ok((initial, WorkingSet::new()))
            }
        }
    }

    /// Commit state and working set as one unit, retrying with backoff.
    pub async fn persist(
        &mut self,
        state: RuntimeState,
        working_set: &WorkingSet,
        tick_id: TickId,
    ) -> Result<()> {
        let checkpoint = Checkpoint {
            state,
            working_set: working_set.clone(),
            tick_id,
            committed_at: Utc::now(),
        };
        self.commit(checkpoint).await
    }

    /// Retry a checkpoint left over from an earlier failed persist.
    pub async fn flush_pending(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(cp) => self.commit(cp).await,
            None => Ok(()),
        }
    }

    pub fn pending_checkpoint(&self) -> Option<&Checkpoint> {
        self.pending.as_ref()
    }

    /// Mirror a checkpoint to the audit store. Never fails the caller.
    pub fn snapshot_for_audit(&self, checkpoint: &Checkpoint) {
        if let Err(e) = self.store.mirror_checkpoint(checkpoint) {
            warn!(tick_id = %checkpoint.tick_id, error = %e, "audit mirror write failed");
        }
    }

    async fn commit(&mut self, checkpoint: Checkpoint) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.store.commit_checkpoint(&checkpoint) {
                Ok(()) => {
                    debug!(tick_id = %checkpoint.tick_id, "checkpoint committed");
                    self.pending = None;
                    self.snapshot_for_audit(&checkpoint);
                    return Ok(());
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        warn!(
                            tick_id = %checkpoint.tick_id,
                            attempts = attempt,
                            error = %e,
                            "checkpoint not persisted, keeping it for the next tick"
                        );
                        self.pending = Some(checkpoint);
                        return Err(e);
                    }
                    let delay = self.backoff.delay(attempt - 1);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying checkpoint");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
