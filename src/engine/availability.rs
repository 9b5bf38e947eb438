use crate::limits::{PLATFORM_DAILY_CAPACITY, VENDOR_DAILY_CAPACITY};
use crate::model::*;

use super::rules::{first_conflict, Attempt, DaySnapshot, AVAILABILITY_ORDER};

// ── Availability Algorithm ────────────────────────────────────────

/// Mark every slot of the day as open or blocked for `client` on `property_id`.
///
/// Pure over the snapshot: the same snapshot always yields the same result.
/// Day-wide rules (client already booked the property, vendor or platform
/// capacity) block every slot; the slot rules block individual times.
pub fn availability(
    snapshot: &DaySnapshot,
    client: &str,
    property_id: &str,
    vendor_id: &str,
) -> DayAvailability {
    let slots = SlotTime::all_slots()
        .map(|time| {
            let attempt = Attempt {
                client,
                property_id,
                vendor_id,
                time,
                exclude: None,
            };
            let blocked_reason = first_conflict(&AVAILABILITY_ORDER, snapshot, &attempt)
                .map(|c| c.rule);
            SlotAvailability {
                time,
                available: blocked_reason.is_none(),
                blocked_reason,
            }
        })
        .collect();

    DayAvailability {
        property_id: property_id.to_string(),
        date: snapshot.date,
        slots,
        vendor_count: snapshot.vendor_count(vendor_id),
        vendor_limit: VENDOR_DAILY_CAPACITY,
        platform_count: snapshot.platform_count(),
        platform_limit: PLATFORM_DAILY_CAPACITY,
    }
}
