use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::requests::CreateBookingRequest;

use super::conflict::{check_no_conflict, now_ms, validate_span};
use super::{forget_court, Engine, EngineError, WalCommand};

/// A booking needs an account or contact details to reach the customer.
pub(super) fn validate_holder(
    user_id: Option<&str>,
    contact: Option<&Contact>,
) -> Result<(), EngineError> {
    validate_text(user_id, MAX_ACTOR_LEN, "user id too long")?;
    match contact {
        Some(c) => validate_contact(c),
        None if user_id.is_some() => Ok(()),
        None => Err(EngineError::InvalidRequest(
            "either a user id or contact details are required",
        )),
    }
}

pub(super) fn validate_contact(contact: &Contact) -> Result<(), EngineError> {
    if contact.name.trim().is_empty() || contact.email.trim().is_empty() {
        return Err(EngineError::InvalidRequest("contact name and email are required"));
    }
    validate_text(Some(&contact.name), MAX_NAME_LEN, "contact name too long")?;
    validate_text(Some(&contact.email), MAX_NAME_LEN, "contact email too long")?;
    validate_text(contact.phone.as_deref(), MAX_NAME_LEN, "contact phone too long")
}

pub(super) fn validate_text(
    text: Option<&str>,
    max: usize,
    msg: &'static str,
) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > max => Err(EngineError::LimitExceeded(msg)),
        _ => Ok(()),
    }
}

impl Engine {
    pub async fn create_court(&self, court: Court) -> Result<(), EngineError> {
        let _gate = self.gate.read().await;
        if self.store.court_count() >= MAX_COURTS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many courts"));
        }
        validate_text(Some(&court.name), MAX_NAME_LEN, "court name too long")?;
        validate_text(Some(&court.facility_name), MAX_NAME_LEN, "facility name too long")?;
        if self.store.contains_court(&court.id) {
            return Err(EngineError::AlreadyExists(court.id));
        }

        let event = Event::CourtCreated {
            court: court.clone(),
        };
        self.wal_append(&event).await?;
        tracing::info!("court {} ({}) created", court.id, court.name);
        self.store
            .insert_court(court.id, Arc::new(RwLock::new(CourtState::new(court))));
        Ok(())
    }

    /// Refuses while the court still holds an occupying booking.
    pub async fn delete_court(&self, id: Ulid) -> Result<(), EngineError> {
        let guard = self.court_write(id).await?;
        if guard.bookings.iter().any(|b| b.status.is_occupying()) {
            return Err(EngineError::HasLiveBookings(id));
        }

        let event = Event::CourtDeleted { id };
        self.wal_append(&event).await?;
        self.store.remove_court(&id);
        forget_court(&guard, &self.store);
        tracing::info!("court {id} deleted");
        Ok(())
    }

    /// Blocks may sit on top of existing bookings; those then surface as
    /// conflicts wherever the booking is checked again.
    pub async fn add_block(
        &self,
        court_id: Ulid,
        span: Span,
        reason: BlockReason,
        note: Option<String>,
        created_by: &str,
    ) -> Result<SlotBlock, EngineError> {
        validate_span(&span)?;
        validate_text(note.as_deref(), MAX_NOTES_LEN, "block note too long")?;
        validate_text(Some(created_by), MAX_ACTOR_LEN, "actor id too long")?;
        let mut guard = self.court_write(court_id).await?;
        if guard.entity_count() >= MAX_ENTITIES_PER_COURT {
            return Err(EngineError::LimitExceeded("too many entities on court"));
        }

        let block = SlotBlock {
            id: Ulid::new(),
            court_id,
            span,
            reason,
            note,
            created_by: created_by.to_string(),
        };
        let under = guard
            .overlapping_bookings(&span)
            .filter(|b| b.status.is_occupying())
            .count();
        if under > 0 {
            tracing::warn!("block {} on court {court_id} overlaps {under} live bookings", block.id);
        }
        let event = Event::BlockAdded {
            block: block.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(block)
    }

    /// Lifting a block resumes any waitlist it was holding back.
    pub async fn remove_block(&self, id: Ulid) -> Result<SlotBlock, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let block = guard
            .blocks
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let event = Event::BlockRemoved {
            id,
            court_id: block.court_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        self.resume_slots_overlapping(&mut guard, &block.span, now_ms())
            .await?;
        Ok(block)
    }

    /// Customers start `pending`; staff bookings start `confirmed`.
    pub async fn create_booking(&self, req: CreateBookingRequest) -> Result<Booking, EngineError> {
        validate_span(&req.span)?;
        validate_holder(req.user_id.as_deref(), req.contact.as_ref())?;
        validate_text(req.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        validate_text(Some(req.actor.id()), MAX_ACTOR_LEN, "actor id too long")?;

        let mut guard = self.court_write(req.court_id).await?;
        if guard.entity_count() >= MAX_ENTITIES_PER_COURT {
            return Err(EngineError::LimitExceeded("too many entities on court"));
        }
        check_no_conflict(&guard, &req.span, None)?;

        let now = now_ms();
        let status = if req.actor.is_staff() {
            BookingStatus::Confirmed
        } else {
            BookingStatus::Pending
        };
        let booking = Booking {
            id: Ulid::new(),
            court_id: req.court_id,
            facility_id: guard.court.facility_id,
            user_id: req.user_id,
            contact: req.contact,
            span: req.span,
            status,
            payment_status: req.payment_status,
            series_id: None,
            price_cents: req.price_cents,
            notes: req.notes,
            created_by: req.actor.id().to_string(),
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL, "origin" => "single")
            .increment(1);
        tracing::info!("booking {} created on court {} as {status}", booking.id, booking.court_id);
        Ok(booking)
    }

    /// Move a live booking to a new window on the same court. The old window
    /// is offered to its waitlist.
    pub async fn reschedule_booking(&self, id: Ulid, span: Span) -> Result<Booking, EngineError> {
        validate_span(&span)?;
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if !booking.status.is_occupying() {
            return Err(EngineError::InvalidRequest("only live bookings can be rescheduled"));
        }
        if booking.span == span {
            return Ok(booking);
        }
        check_no_conflict(&guard, &span, Some(id))?;

        let now = now_ms();
        let event = Event::BookingRescheduled {
            id,
            court_id: booking.court_id,
            span,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!(
            "booking {id} moved from [{}, {}) to [{}, {})",
            booking.span.start,
            booking.span.end,
            span.start,
            span.end
        );
        self.promote_next(&mut guard, booking.span, now).await?;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn set_payment_status(
        &self,
        id: Ulid,
        payment_status: PaymentStatus,
    ) -> Result<Booking, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        if booking.is_seasonal() {
            return Err(EngineError::InvalidRequest("series payment is set on the series"));
        }
        let event = Event::BookingPaymentChanged {
            id,
            court_id: booking.court_id,
            payment_status,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Administrative removal. Series members are cancelled, never deleted.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Option<Ulid>, EngineError> {
        let mut guard = self.resolve_entity_write(&id).await?;
        let booking = guard.booking(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.is_seasonal() {
            return Err(EngineError::InvalidRequest("series bookings cannot be deleted"));
        }
        let event = Event::BookingDeleted {
            id,
            court_id: booking.court_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        tracing::info!("booking {id} deleted");
        if booking.status.is_occupying() {
            return self.promote_next(&mut guard, booking.span, now_ms()).await;
        }
        Ok(None)
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    ///
    /// Mutations are paused for the duration, so nothing appended between the
    /// snapshot and the file swap can be lost.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.gate.write().await;
        let mut events = Vec::new();
        for cs in self.store.courts() {
            let guard = cs.read().await;
            events.push(Event::CourtCreated {
                court: guard.court.clone(),
            });
            for block in &guard.blocks {
                events.push(Event::BlockAdded {
                    block: block.clone(),
                });
            }
            for series in guard.series.values() {
                events.push(Event::SeriesCreated {
                    series: series.clone(),
                    bookings: guard
                        .series_members(&series.id)
                        .into_iter()
                        .cloned()
                        .collect(),
                });
            }
            for booking in guard.bookings.iter().filter(|b| !b.is_seasonal()) {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
            for entry in &guard.waitlist {
                events.push(Event::WaitlistJoined {
                    entry: entry.clone(),
                });
            }
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact {
            name: "Ana".into(),
            email: "ana@example.com".into(),
            phone: None,
        }
    }

    #[test]
    fn holder_needs_user_or_contact() {
        assert!(validate_holder(Some("u1"), None).is_ok());
        assert!(validate_holder(None, Some(&contact())).is_ok());
        assert!(matches!(
            validate_holder(None, None),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn contact_fields_checked() {
        let mut c = contact();
        c.email = "  ".into();
        assert!(validate_contact(&c).is_err());
        let mut c = contact();
        c.phone = Some("1".repeat(MAX_NAME_LEN + 1));
        assert_eq!(
            validate_contact(&c),
            Err(EngineError::LimitExceeded("contact phone too long"))
        );
    }

    #[test]
    fn text_limits() {
        assert!(validate_text(None, 3, "x").is_ok());
        assert!(validate_text(Some("abc"), 3, "x").is_ok());
        assert_eq!(validate_text(Some("abcd"), 3, "x"), Err(EngineError::LimitExceeded("x")));
    }
}
