use std::collections::HashMap;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type inside the engine.
pub type Ms = i64;

/// Half-open booking window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap, so back-to-back bookings are legal.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Court {
    pub id: Ulid,
    pub facility_id: Ulid,
    pub name: String,
    pub facility_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Active,
    Cancelled,
    Completed,
    NoShow,
}

impl BookingStatus {
    /// Statuses that hold the court and therefore conflict with new requests.
    pub fn is_occupying(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Active)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_occupying()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Active => "active",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no-show",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Refunded,
}

/// Customer contact details, used for walk-in bookings and waitlist notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub court_id: Ulid,
    pub facility_id: Ulid,
    pub user_id: Option<String>,
    pub contact: Option<Contact>,
    pub span: Span,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    /// Set for members of a seasonal series; the series owns the member list.
    pub series_id: Option<Ulid>,
    pub price_cents: Option<i64>,
    pub notes: Option<String>,
    /// Caller-supplied actor id, audit only.
    pub created_by: String,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    pub fn is_seasonal(&self) -> bool {
        self.series_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    Maintenance,
    Tournament,
    Weather,
    Other,
}

/// Administrative exclusion over a court window. Never claimable by a waitlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBlock {
    pub id: Ulid,
    pub court_id: Ulid,
    pub span: Span,
    pub reason: BlockReason,
    pub note: Option<String>,
    pub created_by: String,
}

/// Weekly recurrence a series was generated from. Times are UTC wall-clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeasonalPattern {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Series {
    pub id: Ulid,
    pub court_id: Ulid,
    pub facility_id: Ulid,
    pub pattern: SeasonalPattern,
    pub payment_status: PaymentStatus,
    /// Member bookings in chronological order.
    pub booking_ids: Vec<Ulid>,
    pub created_by: String,
    pub created_at: Ms,
}

impl Series {
    /// The first occurrence is the series parent.
    pub fn parent_booking_id(&self) -> Option<Ulid> {
        self.booking_ids.first().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitlistStatus {
    Waitlist,
    Notified,
    Booked,
    Expired,
}

impl WaitlistStatus {
    pub fn is_live(self) -> bool {
        matches!(self, WaitlistStatus::Waitlist | WaitlistStatus::Notified)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryReason {
    /// The reservation window ran out.
    TimedOut,
    /// The slot was re-booked before redemption.
    SlotTaken,
    Declined,
    Withdrawn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: Ulid,
    pub court_id: Ulid,
    pub facility_id: Ulid,
    /// None when staff entered the customer manually.
    pub user_id: Option<String>,
    pub contact: Contact,
    pub span: Span,
    pub status: WaitlistStatus,
    /// Present only while `status == Notified`.
    pub reservation_token: Option<String>,
    /// The token this entry was offered, kept after it stops being redeemable.
    pub spent_token: Option<String>,
    pub reservation_expires_at: Option<Ms>,
    pub notified_at: Option<Ms>,
    pub booking_id: Option<Ulid>,
    pub expiry_reason: Option<ExpiryReason>,
    pub created_at: Ms,
}

impl WaitlistEntry {
    pub fn is_past_due(&self, now: Ms) -> bool {
        self.status == WaitlistStatus::Notified
            && self.reservation_expires_at.is_some_and(|at| at <= now)
    }

    /// Status as seen by readers: a notified entry past its deadline is expired
    /// even before the cascade formally transitions it.
    pub fn effective_status(&self, now: Ms) -> WaitlistStatus {
        if self.is_past_due(now) {
            WaitlistStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_held_by(&self, user_id: Option<&str>, email: &str) -> bool {
        match (user_id, self.user_id.as_deref()) {
            (Some(a), Some(b)) => a == b,
            _ => self.contact.email.eq_ignore_ascii_case(email),
        }
    }
}

/// Everything the engine knows about one court.
#[derive(Debug, Clone)]
pub struct CourtState {
    pub court: Court,
    /// All bookings including terminal ones, sorted by `span.start`.
    pub bookings: Vec<Booking>,
    /// Sorted by `span.start`.
    pub blocks: Vec<SlotBlock>,
    pub series: HashMap<Ulid, Series>,
    /// Waitlist entries in join order, terminal ones retained for audit.
    pub waitlist: Vec<WaitlistEntry>,
}

impl CourtState {
    pub fn new(court: Court) -> Self {
        Self {
            court,
            bookings: Vec::new(),
            blocks: Vec::new(),
            series: HashMap::new(),
            waitlist: Vec::new(),
        }
    }

    pub fn entity_count(&self) -> usize {
        self.bookings.len() + self.blocks.len() + self.waitlist.len()
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    pub fn insert_block(&mut self, block: SlotBlock) {
        let pos = self
            .blocks
            .partition_point(|b| b.span.start <= block.span.start);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<SlotBlock> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    /// Bookings (any status) whose window overlaps the query.
    /// Binary search skips bookings starting at or after `query.end`.
    pub fn overlapping_bookings(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    pub fn overlapping_blocks(&self, query: &Span) -> impl Iterator<Item = &SlotBlock> {
        let right_bound = self.blocks.partition_point(|b| b.span.start < query.end);
        self.blocks[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }

    /// The occupying booking whose window is exactly `span`, if any.
    pub fn occupying_booking_at(&self, span: &Span) -> Option<&Booking> {
        self.overlapping_bookings(span)
            .find(|b| b.span == *span && b.status.is_occupying())
    }

    pub fn entry(&self, id: &Ulid) -> Option<&WaitlistEntry> {
        self.waitlist.iter().find(|e| e.id == *id)
    }

    pub fn entry_mut(&mut self, id: &Ulid) -> Option<&mut WaitlistEntry> {
        self.waitlist.iter_mut().find(|e| e.id == *id)
    }

    /// Waitlist entries for exactly this slot, in join order.
    pub fn entries_for<'a>(&'a self, span: &'a Span) -> impl Iterator<Item = &'a WaitlistEntry> {
        self.waitlist.iter().filter(move |e| e.span == *span)
    }

    /// Series members in chronological order.
    pub fn series_members(&self, series_id: &Ulid) -> Vec<&Booking> {
        match self.series.get(series_id) {
            Some(series) => series
                .booking_ids
                .iter()
                .filter_map(|id| self.booking(id))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// WAL event types. Flat, no nesting beyond the records they carry.
/// This is the WAL record format; multi-row changes are a single event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    CourtCreated {
        court: Court,
    },
    CourtDeleted {
        id: Ulid,
    },
    BlockAdded {
        block: SlotBlock,
    },
    BlockRemoved {
        id: Ulid,
        court_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        court_id: Ulid,
        status: BookingStatus,
        at: Ms,
    },
    BookingRescheduled {
        id: Ulid,
        court_id: Ulid,
        span: Span,
        at: Ms,
    },
    BookingPaymentChanged {
        id: Ulid,
        court_id: Ulid,
        payment_status: PaymentStatus,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        court_id: Ulid,
    },
    SeriesCreated {
        series: Series,
        bookings: Vec<Booking>,
    },
    SeriesStatusChanged {
        id: Ulid,
        court_id: Ulid,
        booking_ids: Vec<Ulid>,
        status: BookingStatus,
        at: Ms,
    },
    SeriesPaymentChanged {
        id: Ulid,
        court_id: Ulid,
        payment_status: PaymentStatus,
        at: Ms,
    },
    WaitlistJoined {
        entry: WaitlistEntry,
    },
    WaitlistNotified {
        id: Ulid,
        court_id: Ulid,
        token: String,
        expires_at: Ms,
        notified_at: Ms,
    },
    WaitlistBooked {
        id: Ulid,
        court_id: Ulid,
        booking: Booking,
    },
    WaitlistExpired {
        id: Ulid,
        court_id: Ulid,
        reason: ExpiryReason,
    },
}

impl Event {
    /// The court an event applies to.
    pub fn court_id(&self) -> Ulid {
        match self {
            Event::CourtCreated { court } => court.id,
            Event::CourtDeleted { id } => *id,
            Event::BlockAdded { block } => block.court_id,
            Event::BookingCreated { booking } => booking.court_id,
            Event::SeriesCreated { series, .. } => series.court_id,
            Event::WaitlistJoined { entry } => entry.court_id,
            Event::BlockRemoved { court_id, .. }
            | Event::BookingStatusChanged { court_id, .. }
            | Event::BookingRescheduled { court_id, .. }
            | Event::BookingPaymentChanged { court_id, .. }
            | Event::BookingDeleted { court_id, .. }
            | Event::SeriesStatusChanged { court_id, .. }
            | Event::SeriesPaymentChanged { court_id, .. }
            | Event::WaitlistNotified { court_id, .. }
            | Event::WaitlistBooked { court_id, .. }
            | Event::WaitlistExpired { court_id, .. } => *court_id,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_overlap_is_symmetric() {
        let spans = [
            Span::new(0, 10),
            Span::new(5, 15),
            Span::new(10, 20),
            Span::new(-5, 30),
            Span::new(12, 13),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
            assert!(a.overlaps(a));
        }
    }

    #[test]
    fn span_validity() {
        assert!(Span { start: 1, end: 2 }.is_valid());
        assert!(!Span { start: 2, end: 2 }.is_valid());
        assert!(!Span { start: 3, end: 2 }.is_valid());
    }

    #[test]
    fn booking_ordering() {
        let c = court();
        let mut cs = CourtState::new(c.clone());
        cs.insert_booking(booking(&c, 300, 400, BookingStatus::Confirmed));
        cs.insert_booking(booking(&c, 100, 200, BookingStatus::Pending));
        cs.insert_booking(booking(&c, 200, 300, BookingStatus::Active));
        assert_eq!(cs.bookings[0].span.start, 100);
        assert_eq!(cs.bookings[1].span.start, 200);
        assert_eq!(cs.bookings[2].span.start, 300);
    }

    #[test]
    fn booking_remove() {
        let c = court();
        let mut cs = CourtState::new(c.clone());
        let b = booking(&c, 100, 200, BookingStatus::Confirmed);
        let id = b.id;
        cs.insert_booking(b);
        assert!(cs.remove_booking(Ulid::new()).is_none());
        assert_eq!(cs.remove_booking(id).map(|b| b.id), Some(id));
        assert!(cs.bookings.is_empty());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let c = court();
        let mut cs = CourtState::new(c.clone());
        cs.insert_booking(booking(&c, 100, 200, BookingStatus::Confirmed));
        cs.insert_booking(booking(&c, 450, 600, BookingStatus::Confirmed));
        cs.insert_booking(booking(&c, 1000, 1100, BookingStatus::Confirmed));

        let hits: Vec<_> = cs.overlapping_bookings(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let c = court();
        let mut cs = CourtState::new(c.clone());
        cs.insert_booking(booking(&c, 100, 200, BookingStatus::Confirmed));
        cs.insert_block(block(&c, 300, 400));
        assert_eq!(cs.overlapping_bookings(&Span::new(200, 300)).count(), 0);
        assert_eq!(cs.overlapping_blocks(&Span::new(200, 300)).count(), 0);
        assert_eq!(cs.overlapping_blocks(&Span::new(399, 500)).count(), 1);
    }

    #[test]
    fn occupying_booking_requires_exact_window_and_live_status() {
        let c = court();
        let mut cs = CourtState::new(c.clone());
        cs.insert_booking(booking(&c, 100, 200, BookingStatus::Cancelled));
        cs.insert_booking(booking(&c, 300, 400, BookingStatus::Confirmed));
        assert!(cs.occupying_booking_at(&Span::new(100, 200)).is_none());
        assert!(cs.occupying_booking_at(&Span::new(300, 350)).is_none());
        assert!(cs.occupying_booking_at(&Span::new(300, 400)).is_some());
    }

    #[test]
    fn status_helpers() {
        assert!(BookingStatus::Pending.is_occupying());
        assert!(BookingStatus::Active.is_occupying());
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(BookingStatus::NoShow.is_terminal());
        assert_eq!(BookingStatus::NoShow.to_string(), "no-show");
        assert!(WaitlistStatus::Notified.is_live());
        assert!(!WaitlistStatus::Booked.is_live());
    }

    #[test]
    fn effective_status_reports_past_due_as_expired() {
        let c = court();
        let entry = WaitlistEntry {
            id: Ulid::new(),
            court_id: c.id,
            facility_id: c.facility_id,
            user_id: None,
            contact: Contact {
                name: "A".into(),
                email: "a@example.com".into(),
                phone: None,
            },
            span: Span::new(0, 10),
            status: WaitlistStatus::Notified,
            reservation_token: Some("tok".into()),
            spent_token: None,
            reservation_expires_at: Some(1_000),
            notified_at: Some(0),
            booking_id: None,
            expiry_reason: None,
            created_at: 0,
        };
        assert_eq!(entry.effective_status(999), WaitlistStatus::Notified);
        assert_eq!(entry.effective_status(1_000), WaitlistStatus::Expired);
        assert!(entry.is_held_by(None, "A@Example.com"));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let c = court();
        let event = Event::BookingCreated {
            booking: booking(&c, 0, 60_000, BookingStatus::Pending),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.court_id(), c.id);
    }
}
