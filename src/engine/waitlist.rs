use std::collections::HashSet;

use chrono::DateTime;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Channel, NotificationRequest, TemplateData};
use crate::requests::{JoinWaitlistRequest, RedeemOutcome};

use super::conflict::{find_conflicts, now_ms, validate_span};
use super::mutations::{validate_contact, validate_text};
use super::{Engine, EngineError};

fn generate_token() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(RESERVATION_TOKEN_LEN)
        .map(char::from)
        .collect()
}

fn rfc3339(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

impl Engine {
    /// Queue for a slot that is currently booked. Only the exact window of an
    /// occupying booking can be waited on.
    pub async fn join_waitlist(&self, req: JoinWaitlistRequest) -> Result<WaitlistEntry, EngineError> {
        validate_span(&req.span)?;
        validate_contact(&req.contact)?;
        validate_text(req.user_id.as_deref(), MAX_ACTOR_LEN, "user id too long")?;

        let now = now_ms();
        let mut guard = self.court_write(req.court_id).await?;
        if guard.occupying_booking_at(&req.span).is_none() {
            return Err(EngineError::SlotNotBooked);
        }
        if guard.entity_count() >= MAX_ENTITIES_PER_COURT {
            return Err(EngineError::LimitExceeded("too many entities on court"));
        }
        self.expire_overdue_in_slot(&mut guard, req.span, now).await?;

        let live: Vec<&WaitlistEntry> = guard
            .entries_for(&req.span)
            .filter(|e| e.status.is_live())
            .collect();
        if let Some(mine) = live
            .iter()
            .find(|e| e.is_held_by(req.user_id.as_deref(), &req.contact.email))
        {
            return Err(EngineError::AlreadyWaitlisted(mine.id));
        }
        if live.len() >= self.config.waitlist_depth {
            return Err(EngineError::WaitlistFull);
        }

        let entry = WaitlistEntry {
            id: Ulid::new(),
            court_id: req.court_id,
            facility_id: guard.court.facility_id,
            user_id: req.user_id,
            contact: req.contact,
            span: req.span,
            status: WaitlistStatus::Waitlist,
            reservation_token: None,
            spent_token: None,
            reservation_expires_at: None,
            notified_at: None,
            booking_id: None,
            expiry_reason: None,
            created_at: now,
        };
        let event = Event::WaitlistJoined {
            entry: entry.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::WAITLIST_JOINS_TOTAL).increment(1);
        tracing::info!("waitlist entry {} joined for court {}", entry.id, entry.court_id);
        Ok(entry)
    }

    /// Turn a reservation token into a confirmed booking. Safe to call any
    /// number of times; every answer is an outcome, never an error.
    pub async fn redeem_reservation(&self, token: &str) -> Result<RedeemOutcome, EngineError> {
        self.redeem_reservation_at(token, now_ms()).await
    }

    pub async fn redeem_reservation_at(
        &self,
        token: &str,
        now: Ms,
    ) -> Result<RedeemOutcome, EngineError> {
        let outcome = self.redeem(token, now).await?;
        metrics::counter!(
            crate::observability::REDEMPTIONS_TOTAL,
            "outcome" => crate::observability::redeem_label(&outcome)
        )
        .increment(1);
        Ok(outcome)
    }

    async fn redeem(&self, token: &str, now: Ms) -> Result<RedeemOutcome, EngineError> {
        let Some(entry_id) = self.store.entry_for_token(token) else {
            return Ok(RedeemOutcome::InvalidToken);
        };
        let mut guard = match self.resolve_entity_write(&entry_id).await {
            Ok(guard) => guard,
            Err(EngineError::NotFound(_)) => return Ok(RedeemOutcome::InvalidToken),
            Err(e) => return Err(e),
        };
        let Some(entry) = guard.entry(&entry_id).cloned() else {
            return Ok(RedeemOutcome::InvalidToken);
        };

        match entry.status {
            WaitlistStatus::Booked => Ok(match entry.booking_id {
                Some(booking_id) => RedeemOutcome::AlreadyBooked { booking_id },
                None => RedeemOutcome::InvalidToken,
            }),
            WaitlistStatus::Expired => Ok(match entry.expiry_reason {
                Some(ExpiryReason::TimedOut) => RedeemOutcome::Expired,
                Some(ExpiryReason::SlotTaken) => RedeemOutcome::SlotNoLongerAvailable,
                _ => RedeemOutcome::InvalidToken,
            }),
            WaitlistStatus::Waitlist => Ok(RedeemOutcome::InvalidToken),
            WaitlistStatus::Notified => {
                if entry.reservation_token.as_deref() != Some(token) {
                    return Ok(RedeemOutcome::InvalidToken);
                }
                if entry.is_past_due(now) {
                    self.expire_entry(&mut guard, &entry, ExpiryReason::TimedOut, now)
                        .await?;
                    return Ok(RedeemOutcome::Expired);
                }
                if !find_conflicts(&guard, &entry.span, None, None).is_empty() {
                    self.expire_entry(&mut guard, &entry, ExpiryReason::SlotTaken, now)
                        .await?;
                    return Ok(RedeemOutcome::SlotNoLongerAvailable);
                }

                let booking = Booking {
                    id: Ulid::new(),
                    court_id: entry.court_id,
                    facility_id: entry.facility_id,
                    user_id: entry.user_id.clone(),
                    contact: Some(entry.contact.clone()),
                    span: entry.span,
                    status: BookingStatus::Confirmed,
                    payment_status: PaymentStatus::Pending,
                    series_id: None,
                    price_cents: None,
                    notes: None,
                    created_by: entry
                        .user_id
                        .clone()
                        .unwrap_or_else(|| entry.contact.email.clone()),
                    created_at: now,
                    updated_at: now,
                };
                let booking_id = booking.id;
                let event = Event::WaitlistBooked {
                    id: entry.id,
                    court_id: entry.court_id,
                    booking,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL, "origin" => "waitlist")
                    .increment(1);
                tracing::info!("waitlist entry {} redeemed as booking {booking_id}", entry.id);
                Ok(RedeemOutcome::Booked { booking_id })
            }
        }
    }

    /// Expire a notified entry whose reservation window has passed, then
    /// cascade. `Ok(false)` when the entry is not past due.
    pub async fn expire_reservation(&self, entry_id: Ulid) -> Result<bool, EngineError> {
        self.expire_reservation_at(entry_id, now_ms()).await
    }

    pub async fn expire_reservation_at(&self, entry_id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let mut guard = self.resolve_entity_write(&entry_id).await?;
        let entry = guard
            .entry(&entry_id)
            .cloned()
            .ok_or(EngineError::NotFound(entry_id))?;
        if !entry.is_past_due(now) {
            return Ok(false);
        }
        self.expire_entry(&mut guard, &entry, ExpiryReason::TimedOut, now)
            .await?;
        Ok(true)
    }

    /// The notified customer turns the slot down; the next in line is offered it.
    pub async fn decline_reservation(&self, token: &str) -> Result<Option<Ulid>, EngineError> {
        let entry_id = self
            .store
            .entry_for_token(token)
            .ok_or(EngineError::InvalidRequest("unknown reservation token"))?;
        let mut guard = self.resolve_entity_write(&entry_id).await?;
        let entry = guard
            .entry(&entry_id)
            .cloned()
            .ok_or(EngineError::NotFound(entry_id))?;
        if entry.status != WaitlistStatus::Notified || entry.reservation_token.as_deref() != Some(token) {
            return Err(EngineError::NotWaiting(entry_id));
        }
        self.expire_entry(&mut guard, &entry, ExpiryReason::Declined, now_ms())
            .await
    }

    /// Leave the queue, or give up an outstanding offer.
    pub async fn leave_waitlist(&self, entry_id: Ulid) -> Result<Option<Ulid>, EngineError> {
        let mut guard = self.resolve_entity_write(&entry_id).await?;
        let entry = guard
            .entry(&entry_id)
            .cloned()
            .ok_or(EngineError::NotFound(entry_id))?;
        let reason = match entry.status {
            WaitlistStatus::Waitlist => ExpiryReason::Withdrawn,
            WaitlistStatus::Notified => ExpiryReason::Declined,
            WaitlistStatus::Booked | WaitlistStatus::Expired => {
                return Err(EngineError::NotWaiting(entry_id));
            }
        };
        self.expire_entry(&mut guard, &entry, reason, now_ms()).await
    }

    /// Notified entries whose reservation window has run out, as (entry, court).
    pub fn collect_expired_reservations(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for cs in self.store.courts() {
            if let Ok(guard) = cs.try_read() {
                for entry in &guard.waitlist {
                    if entry.is_past_due(now) {
                        expired.push((entry.id, guard.court.id));
                    }
                }
            }
        }
        expired
    }

    /// Offer every free slot that still has someone waiting. Picks up cascades
    /// interrupted by a crash or held back by a block. Returns promotions made.
    pub async fn resume_stalled_cascades(&self, now: Ms) -> Result<usize, EngineError> {
        let mut promoted = 0;
        for court_id in self.store.court_ids() {
            let waiting = match self.store.get_court(&court_id) {
                Some(cs) => cs
                    .read()
                    .await
                    .waitlist
                    .iter()
                    .any(|e| e.status == WaitlistStatus::Waitlist),
                None => false,
            };
            if !waiting {
                continue;
            }
            let mut guard = match self.court_write(court_id).await {
                Ok(guard) => guard,
                Err(EngineError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let spans = waiting_spans(&guard, None);
            for span in spans {
                if self.promote_next(&mut guard, span, now).await?.is_some() {
                    promoted += 1;
                }
            }
        }
        Ok(promoted)
    }

    pub(super) async fn resume_slots_overlapping(
        &self,
        cs: &mut CourtState,
        span: &Span,
        now: Ms,
    ) -> Result<usize, EngineError> {
        let mut promoted = 0;
        for slot in waiting_spans(cs, Some(span)) {
            if self.promote_next(cs, slot, now).await?.is_some() {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Offer a freed slot to the oldest waiting entry.
    ///
    /// Overdue offers on the slot are expired first. Nothing happens while a
    /// live offer is outstanding or while the slot is still taken, so at most
    /// one entry per slot is ever `Notified`.
    pub(super) async fn promote_next(
        &self,
        cs: &mut CourtState,
        span: Span,
        now: Ms,
    ) -> Result<Option<Ulid>, EngineError> {
        self.expire_overdue_in_slot(cs, span, now).await?;
        if cs
            .entries_for(&span)
            .any(|e| e.status == WaitlistStatus::Notified)
        {
            return Ok(None);
        }
        if !find_conflicts(cs, &span, None, None).is_empty() || slot_played_out(cs, &span) {
            return Ok(None);
        }
        let Some(next) = cs
            .entries_for(&span)
            .filter(|e| e.status == WaitlistStatus::Waitlist)
            .min_by_key(|e| e.created_at)
            .cloned()
        else {
            return Ok(None);
        };

        let token = self.issue_token();
        let expires_at = now + self.config.reservation_window_ms();
        let event = Event::WaitlistNotified {
            id: next.id,
            court_id: next.court_id,
            token: token.clone(),
            expires_at,
            notified_at: now,
        };
        self.persist_and_apply(cs, &event).await?;
        metrics::counter!(crate::observability::WAITLIST_PROMOTIONS_TOTAL).increment(1);
        tracing::info!("waitlist entry {} offered slot until {expires_at}", next.id);
        self.send_reservation_notices(&cs.court, &next, &token);
        Ok(Some(next.id))
    }

    /// The booking on `span` was played or missed: nobody will get the slot,
    /// so every live entry for it is closed out.
    pub(super) async fn close_waitlist(&self, cs: &mut CourtState, span: Span) -> Result<usize, EngineError> {
        let live: Vec<WaitlistEntry> = cs
            .entries_for(&span)
            .filter(|e| e.status.is_live())
            .cloned()
            .collect();
        for entry in &live {
            self.record_expiry(cs, entry, ExpiryReason::SlotTaken).await?;
        }
        Ok(live.len())
    }

    /// Expire one entry and hand the slot on.
    async fn expire_entry(
        &self,
        cs: &mut CourtState,
        entry: &WaitlistEntry,
        reason: ExpiryReason,
        now: Ms,
    ) -> Result<Option<Ulid>, EngineError> {
        self.record_expiry(cs, entry, reason).await?;
        self.promote_next(cs, entry.span, now).await
    }

    async fn expire_overdue_in_slot(
        &self,
        cs: &mut CourtState,
        span: Span,
        now: Ms,
    ) -> Result<(), EngineError> {
        let overdue: Vec<WaitlistEntry> = cs
            .entries_for(&span)
            .filter(|e| e.is_past_due(now))
            .cloned()
            .collect();
        for entry in &overdue {
            self.record_expiry(cs, entry, ExpiryReason::TimedOut).await?;
        }
        Ok(())
    }

    async fn record_expiry(
        &self,
        cs: &mut CourtState,
        entry: &WaitlistEntry,
        reason: ExpiryReason,
    ) -> Result<(), EngineError> {
        let event = Event::WaitlistExpired {
            id: entry.id,
            court_id: entry.court_id,
            reason,
        };
        self.persist_and_apply(cs, &event).await?;
        let label = match reason {
            ExpiryReason::TimedOut => "timed_out",
            ExpiryReason::SlotTaken => "slot_taken",
            ExpiryReason::Declined => "declined",
            ExpiryReason::Withdrawn => "withdrawn",
        };
        metrics::counter!(crate::observability::WAITLIST_EXPIRED_TOTAL, "reason" => label).increment(1);
        tracing::info!("waitlist entry {} expired: {label}", entry.id);
        Ok(())
    }

    fn issue_token(&self) -> String {
        loop {
            let token = generate_token();
            if !self.store.contains_token(&token) {
                return token;
            }
        }
    }

    fn send_reservation_notices(&self, court: &Court, entry: &WaitlistEntry, token: &str) {
        let template = TemplateData {
            facility_name: court.facility_name.clone(),
            court_name: court.name.clone(),
            start_time: rfc3339(entry.span.start),
            reservation_link: format!(
                "{}/reserve/{token}",
                self.config.reservation_base_url.trim_end_matches('/')
            ),
        };
        self.notify.send(NotificationRequest {
            channel: Channel::Email,
            recipient: entry.contact.email.clone(),
            template: template.clone(),
        });
        if let Some(phone) = &entry.contact.phone {
            self.notify.send(NotificationRequest {
                channel: Channel::Sms,
                recipient: phone.clone(),
                template,
            });
        }
    }
}

/// The latest booking on exactly this window ran its course. That slot was
/// used, not freed, and is never offered.
fn slot_played_out(cs: &CourtState, span: &Span) -> bool {
    cs.overlapping_bookings(span)
        .filter(|b| b.span == *span)
        .max_by_key(|b| (b.updated_at, b.id))
        .is_some_and(|b| matches!(b.status, BookingStatus::Completed | BookingStatus::NoShow))
}

/// Distinct windows with someone in `Waitlist` state, optionally limited to
/// those overlapping `within`. Oldest waiter first.
fn waiting_spans(cs: &CourtState, within: Option<&Span>) -> Vec<Span> {
    let mut seen = HashSet::new();
    cs.waitlist
        .iter()
        .filter(|e| e.status == WaitlistStatus::Waitlist)
        .filter(|e| within.is_none_or(|w| e.span.overlaps(w)))
        .filter(|e| seen.insert(e.span))
        .map(|e| e.span)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    #[test]
    fn tokens_are_long_and_url_safe() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), RESERVATION_TOKEN_LEN);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn rfc3339_is_utc() {
        assert_eq!(rfc3339(1_704_103_200_000), "2024-01-01T10:00:00+00:00");
    }

    #[test]
    fn waiting_spans_dedupes_and_filters() {
        let court = fixtures::court();
        let mut cs = CourtState::new(court.clone());
        let entry = |start: Ms, status: WaitlistStatus| WaitlistEntry {
            id: Ulid::new(),
            court_id: court.id,
            facility_id: court.facility_id,
            user_id: None,
            contact: Contact {
                name: "A".into(),
                email: format!("{start}@example.com"),
                phone: None,
            },
            span: Span::new(start, start + 100),
            status,
            reservation_token: None,
            spent_token: None,
            reservation_expires_at: None,
            notified_at: None,
            booking_id: None,
            expiry_reason: None,
            created_at: 0,
        };
        cs.waitlist.push(entry(1_000, WaitlistStatus::Waitlist));
        cs.waitlist.push(entry(1_000, WaitlistStatus::Waitlist));
        cs.waitlist.push(entry(2_000, WaitlistStatus::Expired));
        cs.waitlist.push(entry(3_000, WaitlistStatus::Waitlist));

        assert_eq!(
            waiting_spans(&cs, None),
            vec![Span::new(1_000, 1_100), Span::new(3_000, 3_100)]
        );
        assert_eq!(
            waiting_spans(&cs, Some(&Span::new(2_950, 3_050))),
            vec![Span::new(3_000, 3_100)]
        );
    }
}
