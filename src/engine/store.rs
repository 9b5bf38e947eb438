use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedLedger = Arc<RwLock<DayLedger>>;

/// Every request sharing one preferred date (or the unscheduled bucket).
/// All rules are scoped to one date, so holding this ledger's write lock
/// serializes every competing writer for that day.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub key: DayKey,
    /// Sorted by `(preferred_time, id)`.
    pub visits: Vec<VisitRequest>,
}

fn sort_key(v: &VisitRequest) -> (Option<SlotTime>, Ulid) {
    (v.preferred_time(), v.id)
}

impl DayLedger {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            visits: Vec::new(),
        }
    }

    /// Insert maintaining sort order.
    pub fn insert(&mut self, visit: VisitRequest) {
        let key = sort_key(&visit);
        let pos = self
            .visits
            .binary_search_by(|v| sort_key(v).cmp(&key))
            .unwrap_or_else(|e| e);
        self.visits.insert(pos, visit);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<VisitRequest> {
        let pos = self.visits.iter().position(|v| v.id == id)?;
        Some(self.visits.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&VisitRequest> {
        self.visits.iter().find(|v| v.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut VisitRequest> {
        self.visits.iter_mut().find(|v| v.id == id)
    }

    pub fn contains(&self, id: Ulid) -> bool {
        self.get(id).is_some()
    }

    pub fn active(&self) -> impl Iterator<Item = &VisitRequest> {
        self.visits.iter().filter(|v| v.status.is_active())
    }
}

pub struct LedgerStore {
    days: DashMap<DayKey, SharedLedger>,
    /// Reverse lookup: visit id → the ledger currently holding it.
    visit_to_day: DashMap<Ulid, DayKey>,
}

impl Default for LedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
            visit_to_day: DashMap::new(),
        }
    }

    // ── Ledgers ──────────────────────────────────────────────

    pub fn ledger(&self, key: &DayKey) -> Option<SharedLedger> {
        self.days.get(key).map(|e| e.value().clone())
    }

    pub fn ledger_or_create(&self, key: DayKey) -> SharedLedger {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(key))))
            .value()
            .clone()
    }

    /// All ledgers, ordered by key (unscheduled first).
    pub fn ledgers(&self) -> Vec<SharedLedger> {
        let mut entries: Vec<(DayKey, SharedLedger)> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        entries.sort_by_key(|(k, _)| *k);
        entries.into_iter().map(|(_, l)| l).collect()
    }

    /// Forget ledgers that hold no request. Callers must exclude every writer
    /// first; a ledger still locked by a reader is kept.
    pub fn drop_empty_ledgers(&self) -> usize {
        let before = self.days.len();
        self.days
            .retain(|_, ledger| !ledger.try_read().is_ok_and(|l| l.visits.is_empty()));
        before - self.days.len()
    }

    // ── Visit index ──────────────────────────────────────────

    pub fn day_of(&self, id: &Ulid) -> Option<DayKey> {
        self.visit_to_day.get(id).map(|e| *e.value())
    }

    pub fn visit_count(&self) -> usize {
        self.visit_to_day.len()
    }

    // ── Event application ────────────────────────────────────

    /// Apply an event whose effect stays within `ledger`. The caller holds the
    /// write lock; cross-day reschedules go through [`LedgerStore::apply_move`].
    pub fn apply_event(&self, ledger: &mut DayLedger, event: &Event) {
        match event {
            Event::VisitRequested { visit } => {
                self.visit_to_day.insert(visit.id, ledger.key);
                ledger.insert(visit.clone());
            }
            Event::VisitRescheduled { id, schedule } => {
                if let Some(mut visit) = ledger.remove(*id) {
                    visit.schedule = Some(*schedule);
                    ledger.insert(visit);
                }
            }
            Event::VisitDecided {
                id,
                status,
                admin_id,
                admin_note,
                decided_at,
            } => {
                if let Some(visit) = ledger.get_mut(*id) {
                    visit.status = *status;
                    visit.admin_id = Some(admin_id.clone());
                    visit.admin_note = admin_note.clone();
                    visit.decided_at = Some(*decided_at);
                }
            }
            Event::VisitCancelled { id } => {
                ledger.remove(*id);
                self.visit_to_day.remove(id);
            }
        }
    }

    /// Move a request between two ledgers (both write-locked by the caller).
    pub fn apply_move(&self, from: &mut DayLedger, to: &mut DayLedger, id: Ulid, schedule: Schedule) {
        if let Some(mut visit) = from.remove(id) {
            visit.schedule = Some(schedule);
            self.visit_to_day.insert(id, to.key);
            to.insert(visit);
        }
    }
}
