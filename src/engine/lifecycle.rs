use ulid::Ulid;

use crate::model::*;
use crate::requests::{Actor, CancelOutcome};

use super::conflict::now_ms;
use super::{Engine, EngineError};

/// The booking state machine. Terminal states accept nothing.
///
/// ```text
/// pending   -> confirmed | cancelled
/// confirmed -> active | cancelled | no-show
/// active    -> completed | cancelled | no-show
/// ```
pub fn check_transition(from: BookingStatus, to: BookingStatus) -> Result<(), EngineError> {
    use BookingStatus::*;
    let allowed = match from {
        Pending => matches!(to, Confirmed | Cancelled),
        Confirmed => matches!(to, Active | Cancelled | NoShow),
        Active => matches!(to, Completed | Cancelled | NoShow),
        Cancelled | Completed | NoShow => false,
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

impl Engine {
    pub async fn confirm_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Confirmed, now_ms()).await
    }

    pub async fn activate_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Active, now_ms()).await
    }

    pub async fn complete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::Completed, now_ms()).await
    }

    /// Only once the window has ended.
    pub async fn mark_no_show(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.mark_no_show_at(id, now_ms()).await
    }

    pub async fn mark_no_show_at(&self, id: Ulid, now: Ms) -> Result<Booking, EngineError> {
        self.transition(id, BookingStatus::NoShow, now).await
    }

    /// Cancel a booking and offer the freed slot to its waitlist.
    pub async fn cancel_booking(&self, id: Ulid, actor: &Actor) -> Result<CancelOutcome, EngineError> {
        self.cancel_booking_at(id, actor, now_ms()).await
    }

    pub async fn cancel_booking_at(
        &self,
        id: Ulid,
        actor: &Actor,
        now: Ms,
    ) -> Result<CancelOutcome, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        check_transition(booking.status, BookingStatus::Cancelled)?;

        let event = Event::BookingStatusChanged {
            id,
            court_id: booking.court_id,
            status: BookingStatus::Cancelled,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        tracing::info!("booking {id} cancelled by {}", actor.id());

        let promoted = self.promote_next(&mut guard, booking.span, now).await?;
        Ok(CancelOutcome {
            booking_id: id,
            promoted,
        })
    }

    async fn transition(&self, id: Ulid, to: BookingStatus, now: Ms) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        check_transition(booking.status, to)?;
        if booking.is_seasonal() && matches!(to, BookingStatus::Confirmed | BookingStatus::Active) {
            return Err(EngineError::InvalidRequest(
                "series bookings are activated through their series",
            ));
        }
        if to == BookingStatus::NoShow && now < booking.span.end {
            return Err(EngineError::InvalidRequest("no-show can only be marked after the slot ends"));
        }

        let event = Event::BookingStatusChanged {
            id,
            court_id: booking.court_id,
            status: to,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("booking {id}: {} -> {to}", booking.status);
        if matches!(to, BookingStatus::Completed | BookingStatus::NoShow) {
            let closed = self.close_waitlist(&mut guard, booking.span).await?;
            if closed > 0 {
                tracing::info!("closed {closed} waitlist entries for booking {id}");
            }
        }
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use BookingStatus::*;

    const ALL: [BookingStatus; 6] = [Pending, Confirmed, Active, Cancelled, Completed, NoShow];

    #[test]
    fn allowed_transitions() {
        for (from, to) in [
            (Pending, Confirmed),
            (Pending, Cancelled),
            (Confirmed, Active),
            (Confirmed, Cancelled),
            (Confirmed, NoShow),
            (Active, Completed),
            (Active, Cancelled),
            (Active, NoShow),
        ] {
            assert!(check_transition(from, to).is_ok(), "{from} -> {to}");
        }
    }

    #[test]
    fn terminal_states_are_final() {
        for from in [Cancelled, Completed, NoShow] {
            for to in ALL {
                assert_eq!(
                    check_transition(from, to),
                    Err(EngineError::InvalidTransition { from, to })
                );
            }
        }
    }

    #[test]
    fn no_skipping_ahead() {
        assert!(check_transition(Pending, Active).is_err());
        assert!(check_transition(Pending, Completed).is_err());
        assert!(check_transition(Confirmed, Completed).is_err());
        assert!(check_transition(Active, Confirmed).is_err());
        assert!(check_transition(Confirmed, Pending).is_err());
    }
}
