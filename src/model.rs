use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{FIRST_SLOT_MINUTES, LAST_SLOT_MINUTES, SLOT_STEP_MINUTES};

/// Unix milliseconds.
pub type Ms = i64;

pub type UserId = String;
pub type PropertyId = String;

// ── Slot time ────────────────────────────────────────────────────

/// Wall-clock `HH:MM` inside business hours (08:00..=17:00).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotTime {
    minutes: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTimeError {
    Malformed,
    OutsideHours,
}

impl fmt::Display for SlotTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotTimeError::Malformed => write!(f, "time must use the HH:MM format"),
            SlotTimeError::OutsideHours => {
                write!(f, "visits can only be scheduled between 08:00 and 17:00")
            }
        }
    }
}

impl std::error::Error for SlotTimeError {}

impl SlotTime {
    /// Parse a strict `HH:MM` string. `"9:5"` is malformed, `"18:00"` is outside hours.
    pub fn parse(s: &str) -> Result<Self, SlotTimeError> {
        let bytes = s.as_bytes();
        if bytes.len() != 5 || bytes[2] != b':' {
            return Err(SlotTimeError::Malformed);
        }
        let digits = [bytes[0], bytes[1], bytes[3], bytes[4]];
        if !digits.iter().all(u8::is_ascii_digit) {
            return Err(SlotTimeError::Malformed);
        }
        let hours = u16::from(digits[0] - b'0') * 10 + u16::from(digits[1] - b'0');
        let minutes = u16::from(digits[2] - b'0') * 10 + u16::from(digits[3] - b'0');
        if hours > 23 || minutes > 59 {
            return Err(SlotTimeError::Malformed);
        }
        Self::from_minutes(hours * 60 + minutes)
    }

    pub fn from_minutes(minutes: u16) -> Result<Self, SlotTimeError> {
        if !(FIRST_SLOT_MINUTES..=LAST_SLOT_MINUTES).contains(&minutes) {
            return Err(SlotTimeError::OutsideHours);
        }
        Ok(Self { minutes })
    }

    pub fn minutes(&self) -> u16 {
        self.minutes
    }

    /// The fixed platform-wide slot grid, in order.
    pub fn all_slots() -> impl Iterator<Item = SlotTime> {
        (FIRST_SLOT_MINUTES..=LAST_SLOT_MINUTES)
            .step_by(SLOT_STEP_MINUTES as usize)
            .map(|minutes| SlotTime { minutes })
    }
}

impl fmt::Display for SlotTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.minutes / 60, self.minutes % 60)
    }
}

impl FromStr for SlotTime {
    type Err = SlotTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SlotTime {
    type Error = SlotTimeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<SlotTime> for String {
    fn from(t: SlotTime) -> Self {
        t.to_string()
    }
}

/// A concrete date + time. Present or absent as a whole on a visit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub date: NaiveDate,
    pub time: SlotTime,
}

// ── Visit requests ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisitStatus {
    Pending,
    Approved,
    Rejected,
    Concluded,
}

impl VisitStatus {
    /// Active requests count toward every conflict and capacity rule.
    pub fn is_active(&self) -> bool {
        matches!(self, VisitStatus::Pending | VisitStatus::Approved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            VisitStatus::Pending => "pending",
            VisitStatus::Approved => "approved",
            VisitStatus::Rejected => "rejected",
            VisitStatus::Concluded => "concluded",
        }
    }
}

impl fmt::Display for VisitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(VisitStatus::Pending),
            "approved" => Ok(VisitStatus::Approved),
            "rejected" => Ok(VisitStatus::Rejected),
            "concluded" => Ok(VisitStatus::Concluded),
            other => Err(format!("unknown visit status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitRequest {
    pub id: Ulid,
    pub property_id: PropertyId,
    pub user_id: UserId,
    pub requested_at: NaiveDate,
    pub schedule: Option<Schedule>,
    pub phone: Option<String>,
    pub status: VisitStatus,
    pub admin_id: Option<UserId>,
    pub admin_note: Option<String>,
    pub decided_at: Option<NaiveDate>,
}

impl VisitRequest {
    pub fn preferred_date(&self) -> Option<NaiveDate> {
        self.schedule.map(|s| s.date)
    }

    pub fn preferred_time(&self) -> Option<SlotTime> {
        self.schedule.map(|s| s.time)
    }

    /// Ledger key: the scheduled date, or `None` for the unscheduled bucket.
    pub fn day_key(&self) -> DayKey {
        self.preferred_date()
    }
}

/// Day ledgers are keyed by date; `None` holds unscheduled requests.
pub type DayKey = Option<NaiveDate>;

// ── External records (read-only to the engine) ───────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Cliente,
    Vendedor,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub role: Role,
    #[serde(default)]
    pub nome: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub id: PropertyId,
    #[serde(alias = "vendedorId")]
    pub vendedor_id: UserId,
    #[serde(default)]
    pub deleted: bool,
}

// ── WAL record format ────────────────────────────────────────────

/// Flat event log; replaying it in order rebuilds every day ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VisitRequested {
        visit: VisitRequest,
    },
    VisitRescheduled {
        id: Ulid,
        schedule: Schedule,
    },
    VisitDecided {
        id: Ulid,
        status: VisitStatus,
        admin_id: UserId,
        admin_note: Option<String>,
        decided_at: NaiveDate,
    },
    VisitCancelled {
        id: Ulid,
    },
}

impl Event {
    pub fn visit_id(&self) -> Ulid {
        match self {
            Event::VisitRequested { visit } => visit.id,
            Event::VisitRescheduled { id, .. }
            | Event::VisitDecided { id, .. }
            | Event::VisitCancelled { id } => *id,
        }
    }
}

// ── Side effects ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    VisitRequest,
    VisitApproved,
    VisitRejected,
    VisitConcluded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub user_id: UserId,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_id: UserId,
    pub receiver_id: UserId,
    pub property_id: Option<PropertyId>,
    pub text: String,
}

/// A side effect queued by a committed write, dispatched after the lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Notify(Notification),
    Chat(ChatMessage),
}

// ── Rules and query results ──────────────────────────────────────

/// The six booking rules. Also used as the blocked reason for a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRule {
    /// Same client, same property, same day.
    ClientPropertyDay,
    /// Same client, same date and time, any property.
    ClientSlot,
    /// Same property, same date and time.
    PropertySlot,
    VendorCapacity,
    PlatformCapacity,
    /// Any booking on the platform at the same date and time.
    AdminSlot,
}

impl ConflictRule {
    pub fn reason(&self) -> &'static str {
        match self {
            ConflictRule::ClientPropertyDay => "already booked this property today",
            ConflictRule::ClientSlot => "client already booked this time elsewhere",
            ConflictRule::PropertySlot => "slot taken on this property",
            ConflictRule::VendorCapacity => "vendor daily capacity reached",
            ConflictRule::PlatformCapacity => "platform daily capacity reached",
            ConflictRule::AdminSlot => "administration occupied at this time",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ConflictRule::ClientPropertyDay => "client_property_day",
            ConflictRule::ClientSlot => "client_slot",
            ConflictRule::PropertySlot => "property_slot",
            ConflictRule::VendorCapacity => "vendor_capacity",
            ConflictRule::PlatformCapacity => "platform_capacity",
            ConflictRule::AdminSlot => "admin_slot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotAvailability {
    pub time: SlotTime,
    pub available: bool,
    pub blocked_reason: Option<ConflictRule>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DayAvailability {
    pub property_id: PropertyId,
    pub date: NaiveDate,
    pub slots: Vec<SlotAvailability>,
    pub vendor_count: usize,
    pub vendor_limit: usize,
    pub platform_count: usize,
    pub platform_limit: usize,
}

/// Which requests an actor wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitScope {
    Own,
    Vendor,
    All,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::SLOTS_PER_DAY;

    #[test]
    fn slot_time_parses_business_hours() {
        assert_eq!(SlotTime::parse("08:00").unwrap().minutes(), 480);
        assert_eq!(SlotTime::parse("17:00").unwrap().minutes(), 1020);
        assert_eq!(SlotTime::parse("10:15").unwrap().to_string(), "10:15");
    }

    #[test]
    fn slot_time_rejects_outside_hours() {
        assert_eq!(SlotTime::parse("18:00"), Err(SlotTimeError::OutsideHours));
        assert_eq!(SlotTime::parse("07:59"), Err(SlotTimeError::OutsideHours));
        assert_eq!(SlotTime::parse("17:01"), Err(SlotTimeError::OutsideHours));
    }

    #[test]
    fn slot_time_rejects_malformed() {
        for bad in ["9:5", "09:5", "9:05", "0900", "09-00", "ab:cd", "24:00", "10:60", ""] {
            assert_eq!(SlotTime::parse(bad), Err(SlotTimeError::Malformed), "{bad}");
        }
    }

    #[test]
    fn slot_grid_has_nineteen_half_hours() {
        let slots: Vec<String> = SlotTime::all_slots().map(|s| s.to_string()).collect();
        assert_eq!(slots.len(), SLOTS_PER_DAY);
        assert_eq!(slots.len(), 19);
        assert_eq!(slots.first().unwrap(), "08:00");
        assert_eq!(slots[1], "08:30");
        assert_eq!(slots.last().unwrap(), "17:00");
    }

    #[test]
    fn slot_time_serde_as_string() {
        let t = SlotTime::parse("09:30").unwrap();
        assert_eq!(serde_json::to_string(&t).unwrap(), "\"09:30\"");
        let back: SlotTime = serde_json::from_str("\"09:30\"").unwrap();
        assert_eq!(back, t);
        assert!(serde_json::from_str::<SlotTime>("\"19:30\"").is_err());
    }

    #[test]
    fn status_activity() {
        assert!(VisitStatus::Pending.is_active());
        assert!(VisitStatus::Approved.is_active());
        assert!(!VisitStatus::Rejected.is_active());
        assert!(!VisitStatus::Concluded.is_active());
        assert_eq!("concluded".parse::<VisitStatus>(), Ok(VisitStatus::Concluded));
        assert!("done".parse::<VisitStatus>().is_err());
    }

    #[test]
    fn property_record_accepts_camel_case_vendor() {
        let p: PropertyRecord =
            serde_json::from_str(r#"{"id":"1","vendedorId":"2"}"#).unwrap();
        assert_eq!(p.vendedor_id, "2");
        assert!(!p.deleted);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::VisitRequested {
            visit: VisitRequest {
                id: Ulid::new(),
                property_id: "p1".into(),
                user_id: "u1".into(),
                requested_at: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
                schedule: Some(Schedule {
                    date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
                    time: SlotTime::parse("10:00").unwrap(),
                }),
                phone: Some("+258841234567".into()),
                status: VisitStatus::Pending,
                admin_id: None,
                admin_note: None,
                decided_at: None,
            },
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
