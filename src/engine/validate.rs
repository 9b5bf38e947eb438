use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|_| EngineError::InvalidInput(format!("invalid date '{raw}', expected YYYY-MM-DD")))
}

pub(crate) fn parse_future_date(raw: &str, today: NaiveDate) -> Result<NaiveDate, EngineError> {
    let date = parse_date(raw)?;
    if date < today {
        return Err(EngineError::InvalidInput(format!(
            "date {date} is in the past, pick today or a later day"
        )));
    }
    Ok(date)
}

pub(crate) fn parse_time(raw: &str) -> Result<SlotTime, EngineError> {
    SlotTime::parse(raw.trim()).map_err(|e| EngineError::InvalidInput(format!("{e} (got '{raw}')")))
}

pub(crate) fn parse_schedule(date: &str, time: &str, today: NaiveDate) -> Result<Schedule, EngineError> {
    Ok(Schedule {
        date: parse_future_date(date, today)?,
        time: parse_time(time)?,
    })
}

/// Both halves present → validated schedule; otherwise the request is unscheduled.
pub(crate) fn parse_optional_schedule(
    date: Option<&str>,
    time: Option<&str>,
    today: NaiveDate,
) -> Result<Option<Schedule>, EngineError> {
    match (non_empty(date), non_empty(time)) {
        (Some(d), Some(t)) => parse_schedule(d, t, today).map(Some),
        (None, None) => Ok(None),
        (d, t) => {
            tracing::debug!(date = ?d, time = ?t, "incomplete schedule, booking unscheduled");
            Ok(None)
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

pub(crate) fn validate_id(kind: &str, id: &str) -> Result<(), EngineError> {
    if id.is_empty() || id.len() > MAX_ID_LEN {
        return Err(EngineError::InvalidInput(format!("invalid {kind} id")));
    }
    Ok(())
}

pub(crate) fn validate_note(note: Option<&str>) -> Result<(), EngineError> {
    if note.is_some_and(|n| n.len() > MAX_NOTE_LEN) {
        return Err(EngineError::InvalidInput("note too long".into()));
    }
    Ok(())
}

pub(crate) fn validate_phone(phone: Option<&str>) -> Result<(), EngineError> {
    if phone.is_some_and(|p| p.len() > MAX_PHONE_LEN) {
        return Err(EngineError::InvalidInput("phone number too long".into()));
    }
    Ok(())
}

/// Statuses a vendor or admin may set. `pending` is only ever the initial state.
pub(crate) fn parse_decision(raw: &str) -> Result<VisitStatus, EngineError> {
    match raw.parse::<VisitStatus>() {
        Ok(VisitStatus::Pending) | Err(_) => Err(EngineError::InvalidInput(format!(
            "status must be one of approved, rejected, concluded (got '{raw}')"
        ))),
        Ok(status) => Ok(status),
    }
}
