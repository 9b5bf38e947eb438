use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{ConflictRule, PropertyId, SlotTime};

/// Which booking rule rejected an attempt, with enough context for the caller
/// to pick another date or time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub rule: ConflictRule,
    pub date: NaiveDate,
    pub time: Option<SlotTime>,
    pub property_id: PropertyId,
    /// The existing request that collides, for the slot/day rules.
    pub colliding: Option<Ulid>,
    /// Current count and limit, for the capacity rules.
    pub count: Option<usize>,
    pub limit: Option<usize>,
}

impl std::fmt::Display for Conflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let when = match self.time {
            Some(t) => format!("{} at {t}", self.date),
            None => self.date.to_string(),
        };
        match self.rule {
            ConflictRule::ClientPropertyDay => write!(
                f,
                "{}: you already have a visit to property {} on {}",
                self.rule.reason(),
                self.property_id,
                self.date
            ),
            ConflictRule::ClientSlot => write!(
                f,
                "{}: you already have another visit on {when}",
                self.rule.reason()
            ),
            ConflictRule::PropertySlot => write!(
                f,
                "{}: property {} is already booked on {when}",
                self.rule.reason(),
                self.property_id
            ),
            ConflictRule::VendorCapacity | ConflictRule::PlatformCapacity => write!(
                f,
                "{}: {}/{} visits already booked on {}",
                self.rule.reason(),
                self.count.unwrap_or_default(),
                self.limit.unwrap_or_default(),
                self.date
            ),
            ConflictRule::AdminSlot => write!(
                f,
                "{}: another visit is already scheduled on {when}",
                self.rule.reason()
            ),
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    InvalidInput(String),
    NotFound(String),
    Forbidden(String),
    Conflict(Conflict),
    TooManyRequests { retry_after_secs: u64 },
    Unavailable(String),
}

impl EngineError {
    pub fn conflict_rule(&self) -> Option<ConflictRule> {
        match self {
            EngineError::Conflict(c) => Some(c.rule),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::Conflict(c) => write!(f, "conflict: {c}"),
            EngineError::TooManyRequests { retry_after_secs } => {
                write!(f, "too many requests, retry in {retry_after_secs}s")
            }
            EngineError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<Conflict> for EngineError {
    fn from(c: Conflict) -> Self {
        EngineError::Conflict(c)
    }
}
