use std::collections::{BTreeSet, HashSet};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::availability;
use super::rules::DaySnapshot;
use super::validate::{parse_future_date, validate_id};
use super::{Engine, EngineError};

impl Engine {
    /// Open and blocked slots of one day for `client` looking at `property_id`.
    pub async fn availability(
        &self,
        property_id: &str,
        date: &str,
        client: &str,
    ) -> Result<DayAvailability, EngineError> {
        validate_id("property", property_id)?;
        let date = parse_future_date(date, self.clock.today())?;
        let property = self.live_property(property_id).await?;
        let snapshot = self.day_snapshot(date).await?;
        Ok(availability(&snapshot, client, &property.id, &property.vendedor_id))
    }

    /// All active requests on `date`, platform-wide, under a read lock.
    pub async fn day_snapshot(&self, date: NaiveDate) -> Result<DaySnapshot, EngineError> {
        let Some(ledger) = self.store.ledger(&Some(date)) else {
            return Ok(DaySnapshot {
                date,
                visits: Vec::new(),
            });
        };
        let guard = ledger.read().await;
        self.snapshot_of(&guard, date).await
    }

    pub fn visit_count(&self) -> usize {
        self.store.visit_count()
    }

    pub async fn get_visit(&self, id: Ulid) -> Option<VisitRequest> {
        let key = self.store.day_of(&id)?;
        let ledger = self.store.ledger(&key)?;
        let guard = ledger.read().await;
        guard.get(id).cloned()
    }

    /// Requests visible to `actor` in `scope`, newest first.
    pub async fn list_visits(
        &self,
        actor: &str,
        scope: VisitScope,
        status: Option<VisitStatus>,
    ) -> Result<Vec<VisitRequest>, EngineError> {
        let actor = self.known_user(actor).await?;
        match scope {
            VisitScope::Own => {}
            VisitScope::Vendor if matches!(actor.role, Role::Vendedor | Role::Admin) => {}
            VisitScope::All if actor.role == Role::Admin => {}
            _ => {
                return Err(EngineError::Forbidden(format!(
                    "{} may not list {scope:?} visit requests",
                    actor.id
                )));
            }
        }

        let mut visits = Vec::new();
        for ledger in self.store.ledgers() {
            let guard = ledger.read().await;
            visits.extend(
                guard
                    .visits
                    .iter()
                    .filter(|v| status.is_none_or(|s| v.status == s))
                    .filter(|v| scope != VisitScope::Own || v.user_id == actor.id)
                    .cloned(),
            );
        }

        if scope == VisitScope::Vendor {
            let owned = self.owned_properties(&actor.id, &visits).await?;
            visits.retain(|v| owned.contains(&v.property_id));
        }

        visits.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(visits)
    }

    /// Listed properties among `visits` whose vendor is `vendor_id`.
    async fn owned_properties(
        &self,
        vendor_id: &str,
        visits: &[VisitRequest],
    ) -> Result<HashSet<PropertyId>, EngineError> {
        let candidates: BTreeSet<&str> = visits.iter().map(|v| v.property_id.as_str()).collect();
        let mut owned = HashSet::new();
        for id in candidates {
            if let Some(p) = self.directory.get_property(id).await?
                && !p.deleted
                && p.vendedor_id == vendor_id
            {
                owned.insert(p.id);
            }
        }
        Ok(owned)
    }
}
