use ulid::Ulid;

use crate::model::{BookingStatus, Ms};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    InvalidWindow { start: Ms, end: Ms },
    InvalidTimeOfDay(String),
    InvalidRequest(&'static str),
    /// Overlapping occupying booking or slot block.
    SlotConflict(Ulid),
    InvalidTransition {
        from: BookingStatus,
        to: BookingStatus,
    },
    NoOccurrencesGenerated,
    PaymentNotConfirmed(Ulid),
    SlotNotBooked,
    WaitlistFull,
    AlreadyWaitlisted(Ulid),
    NotWaiting(Ulid),
    HasLiveBookings(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidWindow { start, end } => {
                write!(f, "invalid window [{start}, {end}): start must be before end")
            }
            EngineError::InvalidTimeOfDay(s) => write!(f, "invalid time of day {s:?}, expected HH:MM"),
            EngineError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            EngineError::SlotConflict(id) => write!(f, "slot conflicts with: {id}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid booking transition {from} -> {to}")
            }
            EngineError::NoOccurrencesGenerated => {
                write!(f, "seasonal request matches no dates in the season")
            }
            EngineError::PaymentNotConfirmed(id) => {
                write!(f, "series {id} cannot be activated before payment is confirmed")
            }
            EngineError::SlotNotBooked => {
                write!(f, "slot is not booked; book it directly instead of joining the waitlist")
            }
            EngineError::WaitlistFull => write!(f, "waitlist for this slot is full"),
            EngineError::AlreadyWaitlisted(id) => {
                write!(f, "already on the waitlist for this slot (entry {id})")
            }
            EngineError::NotWaiting(id) => write!(f, "waitlist entry {id} is no longer waiting"),
            EngineError::HasLiveBookings(id) => {
                write!(f, "cannot delete court {id}: has live bookings")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
