use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Rejects empty/inverted windows, then out-of-range ones.
pub fn validate_span(span: &Span) -> Result<(), EngineError> {
    use crate::limits::*;
    if !span.is_valid() {
        return Err(EngineError::InvalidWindow {
            start: span.start,
            end: span.end,
        });
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(())
}

/// Something already holding part of a candidate window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conflict {
    Booking(Ulid),
    Block(Ulid),
}

impl Conflict {
    pub fn id(&self) -> Ulid {
        match self {
            Conflict::Booking(id) | Conflict::Block(id) => *id,
        }
    }
}

/// Occupying bookings and blocks on this court overlapping `span`.
///
/// `exclude_booking` skips the booking being edited; `exclude_series` skips
/// every member of a series so it can be activated without flagging itself.
/// Bookings are reported before blocks, each in window order.
pub fn find_conflicts(
    cs: &CourtState,
    span: &Span,
    exclude_booking: Option<Ulid>,
    exclude_series: Option<Ulid>,
) -> Vec<Conflict> {
    let mut conflicts: Vec<Conflict> = cs
        .overlapping_bookings(span)
        .filter(|b| b.status.is_occupying())
        .filter(|b| Some(b.id) != exclude_booking)
        .filter(|b| exclude_series.is_none() || b.series_id != exclude_series)
        .map(|b| Conflict::Booking(b.id))
        .collect();
    conflicts.extend(cs.overlapping_blocks(span).map(|b| Conflict::Block(b.id)));
    conflicts
}

/// Write-path guard: first conflict becomes a `SlotConflict` error.
pub(crate) fn check_no_conflict(
    cs: &CourtState,
    span: &Span,
    exclude_booking: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflicts(cs, span, exclude_booking, None).first() {
        Some(conflict) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            Err(EngineError::SlotConflict(conflict.id()))
        }
        None => Ok(()),
    }
}

/// Pairs of occupying bookings that overlap each other. The write path makes
/// this impossible; a non-empty result means the stored data was corrupted
/// or imported around the lock.
pub fn double_bookings(cs: &CourtState) -> Vec<(Ulid, Ulid)> {
    let live: Vec<&Booking> = cs
        .bookings
        .iter()
        .filter(|b| b.status.is_occupying())
        .collect();
    let mut pairs = Vec::new();
    for (i, a) in live.iter().enumerate() {
        for b in &live[i + 1..] {
            // sorted by start: nothing further can overlap `a`
            if b.span.start >= a.span.end {
                break;
            }
            pairs.push((a.id, b.id));
        }
    }
    pairs
}
