use ulid::Ulid;

use crate::model::*;

use super::conflict::{double_bookings, find_conflicts, validate_span, Conflict};
use super::{Engine, EngineError};

impl Engine {
    pub async fn get_court_info(&self, court_id: &Ulid) -> Option<Court> {
        let cs = self.store.get_court(court_id)?;
        let guard = cs.read().await;
        Some(guard.court.clone())
    }

    pub async fn list_courts(&self) -> Vec<Court> {
        let mut courts = Vec::new();
        for cs in self.store.courts() {
            courts.push(cs.read().await.court.clone());
        }
        courts.sort_by_key(|c| c.id);
        courts
    }

    pub async fn get_booking(&self, id: &Ulid) -> Option<Booking> {
        let court_id = self.store.court_for_entity(id)?;
        let cs = self.store.get_court(&court_id)?;
        let guard = cs.read().await;
        guard.booking(id).cloned()
    }

    /// Bookings of any status overlapping `window`, in start order.
    pub async fn list_bookings(&self, court_id: Ulid, window: Span) -> Result<Vec<Booking>, EngineError> {
        validate_span(&window)?;
        let cs = self
            .store
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.read().await;
        Ok(guard.overlapping_bookings(&window).cloned().collect())
    }

    pub async fn list_blocks(&self, court_id: Ulid, window: Span) -> Result<Vec<SlotBlock>, EngineError> {
        validate_span(&window)?;
        let cs = self
            .store
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.read().await;
        Ok(guard.overlapping_blocks(&window).cloned().collect())
    }

    /// Read-only conflict check, e.g. for showing availability before submit.
    /// Writes repeat the check under the court lock.
    pub async fn conflicts(
        &self,
        court_id: Ulid,
        span: Span,
        exclude_booking: Option<Ulid>,
        exclude_series: Option<Ulid>,
    ) -> Result<Vec<Conflict>, EngineError> {
        validate_span(&span)?;
        let cs = self
            .store
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.read().await;
        Ok(find_conflicts(&guard, &span, exclude_booking, exclude_series))
    }

    /// Integrity check: overlapping occupying bookings on one court.
    pub async fn detect_double_bookings(&self, court_id: Ulid) -> Result<Vec<(Ulid, Ulid)>, EngineError> {
        let cs = self
            .store
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.read().await;
        let pairs = double_bookings(&guard);
        if !pairs.is_empty() {
            tracing::error!("court {court_id} has {} double-booked pairs", pairs.len());
        }
        Ok(pairs)
    }

    /// Waitlist entries for a court in join order, optionally one slot only.
    /// Offers past their deadline read as `Expired` even before the sweep
    /// gets to them.
    pub async fn list_waitlist(
        &self,
        court_id: Ulid,
        slot: Option<Span>,
        now: Ms,
    ) -> Result<Vec<WaitlistEntry>, EngineError> {
        let cs = self
            .store
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.read().await;
        Ok(guard
            .waitlist
            .iter()
            .filter(|e| slot.is_none_or(|s| e.span == s))
            .map(|e| {
                let mut entry = e.clone();
                entry.status = e.effective_status(now);
                entry
            })
            .collect())
    }

    pub async fn get_waitlist_entry(&self, id: &Ulid, now: Ms) -> Option<WaitlistEntry> {
        let court_id = self.store.court_for_entity(id)?;
        let cs = self.store.get_court(&court_id)?;
        let guard = cs.read().await;
        let mut entry = guard.entry(id)?.clone();
        entry.status = entry.effective_status(now);
        Some(entry)
    }
}
