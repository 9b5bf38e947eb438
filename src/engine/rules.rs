//! The booking rules as pure functions over one day's active requests.
//!
//! Every rule is scoped to a single calendar date, so one snapshot read per
//! attempt is enough. Availability and submission share the predicates but
//! evaluate them in their own fixed precedence; the first rule that fires
//! names the reason.

use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::{PLATFORM_DAILY_CAPACITY, VENDOR_DAILY_CAPACITY};
use crate::model::*;

use super::error::Conflict;

/// Precedence used when admitting a booking.
pub const SUBMIT_ORDER: [ConflictRule; 6] = [
    ConflictRule::ClientPropertyDay,
    ConflictRule::ClientSlot,
    ConflictRule::PropertySlot,
    ConflictRule::VendorCapacity,
    ConflictRule::PlatformCapacity,
    ConflictRule::AdminSlot,
];

/// Precedence used when reporting why a slot is blocked.
pub const AVAILABILITY_ORDER: [ConflictRule; 6] = [
    ConflictRule::ClientPropertyDay,
    ConflictRule::PropertySlot,
    ConflictRule::ClientSlot,
    ConflictRule::VendorCapacity,
    ConflictRule::PlatformCapacity,
    ConflictRule::AdminSlot,
];

/// A client moving their own pending request only collides on the property slot.
pub const RESCHEDULE_ORDER: [ConflictRule; 1] = [ConflictRule::PropertySlot];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveVisit {
    pub id: Ulid,
    pub property_id: PropertyId,
    pub user_id: UserId,
    pub vendor_id: UserId,
    pub time: SlotTime,
}

/// All active requests on one date, platform-wide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaySnapshot {
    pub date: NaiveDate,
    pub visits: Vec<ActiveVisit>,
}

impl DaySnapshot {
    /// Build from a day's requests. `vendors` maps property id to owning vendor;
    /// requests whose property is unknown (removed listing) are left out.
    pub fn build<'a>(
        date: NaiveDate,
        requests: impl IntoIterator<Item = &'a VisitRequest>,
        vendors: &HashMap<PropertyId, UserId>,
    ) -> Self {
        let visits = requests
            .into_iter()
            .filter(|v| v.status.is_active())
            .filter_map(|v| {
                let schedule = v.schedule.filter(|s| s.date == date)?;
                let vendor_id = vendors.get(&v.property_id)?;
                Some(ActiveVisit {
                    id: v.id,
                    property_id: v.property_id.clone(),
                    user_id: v.user_id.clone(),
                    vendor_id: vendor_id.clone(),
                    time: schedule.time,
                })
            })
            .collect();
        Self { date, visits }
    }

    pub fn platform_count(&self) -> usize {
        self.visits.len()
    }

    pub fn vendor_count(&self, vendor_id: &str) -> usize {
        self.visits.iter().filter(|v| v.vendor_id == vendor_id).count()
    }
}

/// One booking attempt at a concrete time, evaluated against a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    pub client: &'a str,
    pub property_id: &'a str,
    pub vendor_id: &'a str,
    pub time: SlotTime,
    /// The attempt's own request, when moving an existing one.
    pub exclude: Option<Ulid>,
}

fn others<'s>(snapshot: &'s DaySnapshot, attempt: &Attempt<'_>) -> impl Iterator<Item = &'s ActiveVisit> {
    let exclude = attempt.exclude;
    snapshot.visits.iter().filter(move |v| Some(v.id) != exclude)
}

pub fn client_property_day(snapshot: &DaySnapshot, attempt: &Attempt<'_>) -> Option<Ulid> {
    others(snapshot, attempt)
        .find(|v| v.user_id == attempt.client && v.property_id == attempt.property_id)
        .map(|v| v.id)
}

pub fn client_slot(snapshot: &DaySnapshot, attempt: &Attempt<'_>) -> Option<Ulid> {
    others(snapshot, attempt)
        .find(|v| v.user_id == attempt.client && v.time == attempt.time)
        .map(|v| v.id)
}

pub fn property_slot(snapshot: &DaySnapshot, attempt: &Attempt<'_>) -> Option<Ulid> {
    others(snapshot, attempt)
        .find(|v| v.property_id == attempt.property_id && v.time == attempt.time)
        .map(|v| v.id)
}

pub fn any_slot(snapshot: &DaySnapshot, attempt: &Attempt<'_>) -> Option<Ulid> {
    others(snapshot, attempt)
        .find(|v| v.time == attempt.time)
        .map(|v| v.id)
}

/// Returns the vendor's count when it has reached capacity.
pub fn vendor_at_capacity(snapshot: &DaySnapshot, attempt: &Attempt<'_>) -> Option<usize> {
    let count = others(snapshot, attempt)
        .filter(|v| v.vendor_id == attempt.vendor_id)
        .count();
    (count >= VENDOR_DAILY_CAPACITY).then_some(count)
}

/// Returns the platform count when it has reached capacity.
pub fn platform_at_capacity(snapshot: &DaySnapshot, attempt: &Attempt<'_>) -> Option<usize> {
    let count = others(snapshot, attempt).count();
    (count >= PLATFORM_DAILY_CAPACITY).then_some(count)
}

pub fn check_rule(rule: ConflictRule, snapshot: &DaySnapshot, attempt: &Attempt<'_>) -> Option<Conflict> {
    let conflict = |colliding: Option<Ulid>, count: Option<usize>, limit: Option<usize>| Conflict {
        rule,
        date: snapshot.date,
        time: Some(attempt.time),
        property_id: attempt.property_id.to_string(),
        colliding,
        count,
        limit,
    };
    match rule {
        ConflictRule::ClientPropertyDay => client_property_day(snapshot, attempt)
            .map(|id| Conflict { time: None, ..conflict(Some(id), None, None) }),
        ConflictRule::ClientSlot => {
            client_slot(snapshot, attempt).map(|id| conflict(Some(id), None, None))
        }
        ConflictRule::PropertySlot => {
            property_slot(snapshot, attempt).map(|id| conflict(Some(id), None, None))
        }
        ConflictRule::VendorCapacity => vendor_at_capacity(snapshot, attempt)
            .map(|n| Conflict { time: None, ..conflict(None, Some(n), Some(VENDOR_DAILY_CAPACITY)) }),
        ConflictRule::PlatformCapacity => platform_at_capacity(snapshot, attempt)
            .map(|n| Conflict { time: None, ..conflict(None, Some(n), Some(PLATFORM_DAILY_CAPACITY)) }),
        ConflictRule::AdminSlot => {
            any_slot(snapshot, attempt).map(|id| conflict(Some(id), None, None))
        }
    }
}

/// Evaluate rules in the given order; the first one that fires wins.
pub fn first_conflict(
    order: &[ConflictRule],
    snapshot: &DaySnapshot,
    attempt: &Attempt<'_>,
) -> Option<Conflict> {
    order
        .iter()
        .find_map(|rule| check_rule(*rule, snapshot, attempt))
}
