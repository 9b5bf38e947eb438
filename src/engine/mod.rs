mod availability;
mod error;
mod mutations;
mod queries;
mod rules;
mod store;
mod validate;

pub use availability::availability;
pub use error::{Conflict, EngineError};
pub use mutations::SubmitVisit;
pub use rules::{Attempt, DaySnapshot, AVAILABILITY_ORDER, RESCHEDULE_ORDER, SUBMIT_ORDER};
pub use store::{DayLedger, LedgerStore};

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::directory::Directory;
use crate::model::*;
use crate::notify::Dispatcher;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that arrive while a flush is pending are folded into
/// one batch and share a single fsync; every caller gets the batch's result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-written batch never leaks
    // into the next one.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(batch = batch.len(), "WAL flush failed: {e}");
    }

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// The scheduling engine: day ledgers in memory, every write made durable in
/// the WAL before it is applied.
pub struct Engine {
    pub(super) store: LedgerStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) directory: Arc<dyn Directory>,
    pub(super) dispatcher: Dispatcher,
    pub(super) clock: Arc<dyn Clock>,
    /// Writers hold this shared; compaction takes it exclusively so no append
    /// can slip between its snapshot and the log swap.
    pub(super) commit_gate: RwLock<()>,
}

fn replay_lock_error(_: tokio::sync::TryLockError) -> io::Error {
    io::Error::other("ledger locked during replay")
}

impl Engine {
    /// Replay the WAL at `wal_path` and start its writer task. Must be called
    /// inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        directory: Arc<dyn Directory>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: LedgerStore::new(),
            wal_tx,
            directory,
            dispatcher,
            clock,
            commit_gate: RwLock::new(()),
        };
        for event in &events {
            engine.replay_event(event)?;
        }
        tracing::info!(
            events = events.len(),
            visits = engine.store.visit_count(),
            "replayed {}",
            wal_path.display()
        );
        Ok(engine)
    }

    /// Nothing else holds the ledgers yet, so `try_write` never contends.
    /// Blocking lock calls are off limits here: this runs inside the runtime.
    fn replay_event(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::VisitRequested { visit } => {
                let ledger = self.store.ledger_or_create(visit.day_key());
                let mut guard = ledger.try_write().map_err(replay_lock_error)?;
                self.store.apply_event(&mut guard, event);
            }
            Event::VisitRescheduled { id, schedule } => {
                let Some(from_key) = self.store.day_of(id) else {
                    return Ok(());
                };
                let to_key = Some(schedule.date);
                let from = self.store.ledger_or_create(from_key);
                let mut src = from.try_write().map_err(replay_lock_error)?;
                if from_key == to_key {
                    self.store.apply_event(&mut src, event);
                } else {
                    let to = self.store.ledger_or_create(to_key);
                    let mut dst = to.try_write().map_err(replay_lock_error)?;
                    self.store.apply_move(&mut src, &mut dst, *id, *schedule);
                }
            }
            Event::VisitDecided { id, .. } | Event::VisitCancelled { id } => {
                if let Some(ledger) = self.store.day_of(id).and_then(|k| self.store.ledger(&k)) {
                    let mut guard = ledger.try_write().map_err(replay_lock_error)?;
                    self.store.apply_event(&mut guard, event);
                }
            }
        }
        Ok(())
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    /// WAL-append, then apply to the locked ledger. Nothing is applied if the
    /// append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ledger: &mut DayLedger,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.store.apply_event(ledger, event);
        Ok(())
    }

    /// Lookup visit → day, acquire that ledger's write lock. Retries if the
    /// visit moved to another day while we waited.
    pub(super) async fn lock_visit_day(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<DayLedger>, EngineError> {
        loop {
            let key = self.store.day_of(&id).ok_or_else(|| visit_not_found(id))?;
            let ledger = self.store.ledger(&key).ok_or_else(|| visit_not_found(id))?;
            let guard = ledger.write_owned().await;
            if guard.contains(id) {
                return Ok(guard);
            }
        }
    }

    /// Listed, non-deleted property or `NotFound`.
    pub(super) async fn live_property(&self, id: &str) -> Result<PropertyRecord, EngineError> {
        match self.directory.get_property(id).await? {
            Some(p) if !p.deleted => Ok(p),
            _ => Err(EngineError::NotFound(format!("property {id}"))),
        }
    }

    /// Known user or `Forbidden`.
    pub(super) async fn known_user(&self, id: &str) -> Result<UserRecord, EngineError> {
        self.directory
            .get_user(id)
            .await?
            .ok_or_else(|| EngineError::Forbidden(format!("unknown user {id}")))
    }

    /// Owning vendor for every listed property among `visits`.
    pub(super) async fn vendors_for<'a>(
        &self,
        visits: impl Iterator<Item = &'a VisitRequest>,
    ) -> Result<HashMap<PropertyId, UserId>, EngineError> {
        let ids: BTreeSet<PropertyId> = visits.map(|v| v.property_id.clone()).collect();
        let mut vendors = HashMap::with_capacity(ids.len());
        for id in ids {
            if let Some(p) = self.directory.get_property(&id).await?
                && !p.deleted
            {
                vendors.insert(p.id, p.vendedor_id);
            }
        }
        Ok(vendors)
    }

    /// Active requests of a locked ledger as a rule snapshot.
    pub(super) async fn snapshot_of(
        &self,
        ledger: &DayLedger,
        date: NaiveDate,
    ) -> Result<DaySnapshot, EngineError> {
        let vendors = self.vendors_for(ledger.active()).await?;
        Ok(DaySnapshot::build(date, ledger.active(), &vendors))
    }
}

pub(super) fn visit_not_found(id: Ulid) -> EngineError {
    EngineError::NotFound(format!("visit request {id}"))
}
