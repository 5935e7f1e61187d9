//! Typed request/response contract for each engine operation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::Conflict;
use crate::model::{Contact, Ms, PaymentStatus, Span};

/// Who is acting. Authorization happened upstream; `id` is kept for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Customer { id: String },
    Staff { id: String },
}

impl Actor {
    pub fn id(&self) -> &str {
        match self {
            Actor::Customer { id } | Actor::Staff { id } => id,
        }
    }

    pub fn is_staff(&self) -> bool {
        matches!(self, Actor::Staff { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBookingRequest {
    pub court_id: Ulid,
    pub span: Span,
    /// Self-service requests start `pending`, staff-created ones `confirmed`.
    pub actor: Actor,
    pub user_id: Option<String>,
    /// Required when booking for a customer without an account.
    pub contact: Option<Contact>,
    pub notes: Option<String>,
    pub price_cents: Option<i64>,
    pub payment_status: PaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSeriesRequest {
    pub court_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    /// "HH:MM"
    pub start_time: String,
    /// "HH:MM"
    pub end_time: String,
    pub actor: Actor,
    pub user_id: Option<String>,
    pub contact: Option<Contact>,
    pub notes: Option<String>,
    pub price_cents: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateSeriesRequest {
    pub series_id: Ulid,
    /// Activate even with conflicts; they are still reported.
    pub skip_conflict_check: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinWaitlistRequest {
    pub court_id: Ulid,
    pub span: Span,
    pub user_id: Option<String>,
    pub contact: Contact,
}

/// One series member overlapping something outside the series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesConflict {
    pub booking_id: Ulid,
    pub date: NaiveDate,
    pub start: Ms,
    pub end: Ms,
    pub court_id: Ulid,
    pub conflict: Conflict,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationReport {
    /// Members moved to `active` by this call.
    pub activated: Vec<Ulid>,
    pub conflicts: Vec<SeriesConflict>,
    /// Conflicts were found and the transition did not happen.
    pub blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub booking_id: Ulid,
    /// Waitlist entry offered the freed slot, if any.
    pub promoted: Option<Ulid>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesCancelOutcome {
    pub cancelled: Vec<Ulid>,
    pub promoted: Vec<Ulid>,
}

/// Result of redeeming a reservation token. Every variant is a normal answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RedeemOutcome {
    Booked { booking_id: Ulid },
    /// The token was already redeemed; same booking as the first time.
    AlreadyBooked { booking_id: Ulid },
    Expired,
    SlotNoLongerAvailable,
    InvalidToken,
}

impl RedeemOutcome {
    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            RedeemOutcome::Booked { booking_id } | RedeemOutcome::AlreadyBooked { booking_id } => {
                Some(*booking_id)
            }
            _ => None,
        }
    }

    /// Text for the person holding the link.
    pub fn message(&self) -> &'static str {
        match self {
            RedeemOutcome::Booked { .. } => "Your booking is confirmed.",
            RedeemOutcome::AlreadyBooked { .. } => "This reservation was already booked.",
            RedeemOutcome::Expired => {
                "This reservation link has expired and the slot was offered to the next person."
            }
            RedeemOutcome::SlotNoLongerAvailable => "Sorry, this slot is no longer available.",
            RedeemOutcome::InvalidToken => "This reservation link is not valid.",
        }
    }
}
