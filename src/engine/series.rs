use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::requests::{
    ActivateSeriesRequest, Actor, ActivationReport, CreateSeriesRequest, SeriesCancelOutcome,
    SeriesConflict,
};

use super::conflict::{find_conflicts, now_ms, validate_span};
use super::mutations::{validate_holder, validate_text};
use super::{Engine, EngineError};

/// Parse a 24-hour `HH:MM` wall-clock time.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime, EngineError> {
    NaiveTime::parse_from_str(s, "%H:%M").map_err(|_| EngineError::InvalidTimeOfDay(s.to_string()))
}

/// Every date in `[start, end]` (both inclusive) falling on `day_of_week`,
/// where 0 is Sunday. Empty when the range holds no such weekday.
pub fn occurrence_dates(start: NaiveDate, end: NaiveDate, day_of_week: u8) -> Vec<NaiveDate> {
    let first_offset = (7 + day_of_week as u32 - start.weekday().num_days_from_sunday()) % 7;
    let mut dates = Vec::new();
    let mut current = start.checked_add_days(Days::new(first_offset as u64));
    while let Some(date) = current {
        if date > end {
            break;
        }
        dates.push(date);
        current = date.checked_add_days(Days::new(7));
    }
    dates
}

/// Expand a weekly pattern into one UTC window per matching date.
pub fn expand_series(pattern: &SeasonalPattern) -> Result<Vec<Span>, EngineError> {
    if pattern.end_date <= pattern.start_date {
        return Err(EngineError::InvalidRequest("season must end after it starts"));
    }
    if pattern.day_of_week > 6 {
        return Err(EngineError::InvalidRequest("day of week must be 0 (Sunday) to 6"));
    }
    let dates = occurrence_dates(pattern.start_date, pattern.end_date, pattern.day_of_week);
    if dates.is_empty() {
        return Err(EngineError::NoOccurrencesGenerated);
    }
    if dates.len() > MAX_SERIES_OCCURRENCES {
        return Err(EngineError::LimitExceeded("too many occurrences in season"));
    }

    let spans: Vec<Span> = dates
        .iter()
        .map(|date| Span {
            start: date.and_time(pattern.start_time).and_utc().timestamp_millis(),
            end: date.and_time(pattern.end_time).and_utc().timestamp_millis(),
        })
        .collect();
    if let Some(span) = spans.first()
        && !span.is_valid()
    {
        return Err(EngineError::InvalidWindow {
            start: span.start,
            end: span.end,
        });
    }
    Ok(spans)
}

fn date_of(ms: Ms) -> NaiveDate {
    DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.date_naive())
        .unwrap_or_default()
}

impl Engine {
    /// Create every occurrence of a weekly series as `pending`, or none of them.
    pub async fn create_series(
        &self,
        req: CreateSeriesRequest,
    ) -> Result<(Series, Vec<Booking>), EngineError> {
        let pattern = SeasonalPattern {
            start_date: req.start_date,
            end_date: req.end_date,
            day_of_week: req.day_of_week,
            start_time: parse_time_of_day(&req.start_time)?,
            end_time: parse_time_of_day(&req.end_time)?,
        };
        let spans = expand_series(&pattern)?;
        for span in &spans {
            validate_span(span)?;
        }
        validate_holder(req.user_id.as_deref(), req.contact.as_ref())?;
        validate_text(req.notes.as_deref(), MAX_NOTES_LEN, "notes too long")?;
        validate_text(Some(req.actor.id()), MAX_ACTOR_LEN, "actor id too long")?;

        let mut guard = self.court_write(req.court_id).await?;
        if guard.entity_count() + spans.len() > MAX_ENTITIES_PER_COURT {
            return Err(EngineError::LimitExceeded("too many entities on court"));
        }
        for span in &spans {
            if let Some(conflict) = find_conflicts(&guard, span, None, None).first() {
                metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
                tracing::info!(
                    "series on court {} rejected: {} conflicts with {}",
                    req.court_id,
                    date_of(span.start),
                    conflict.id()
                );
                return Err(EngineError::SlotConflict(conflict.id()));
            }
        }

        let now = now_ms();
        let series_id = Ulid::new();
        let bookings: Vec<Booking> = spans
            .into_iter()
            .map(|span| Booking {
                id: Ulid::new(),
                court_id: guard.court.id,
                facility_id: guard.court.facility_id,
                user_id: req.user_id.clone(),
                contact: req.contact.clone(),
                span,
                status: BookingStatus::Pending,
                payment_status: PaymentStatus::Pending,
                series_id: Some(series_id),
                price_cents: req.price_cents,
                notes: req.notes.clone(),
                created_by: req.actor.id().to_string(),
                created_at: now,
                updated_at: now,
            })
            .collect();
        let series = Series {
            id: series_id,
            court_id: guard.court.id,
            facility_id: guard.court.facility_id,
            pattern,
            payment_status: PaymentStatus::Pending,
            booking_ids: bookings.iter().map(|b| b.id).collect(),
            created_by: req.actor.id().to_string(),
            created_at: now,
        };

        let event = Event::SeriesCreated {
            series: series.clone(),
            bookings: bookings.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL, "origin" => "series")
            .increment(bookings.len() as u64);
        tracing::info!(
            "series {series_id} created on court {} with {} occurrences",
            series.court_id,
            bookings.len()
        );
        Ok((series, bookings))
    }

    /// Payment for a series is tracked on the series and mirrored on every member.
    pub async fn set_series_payment(
        &self,
        series_id: Ulid,
        payment_status: PaymentStatus,
    ) -> Result<Series, EngineError> {
        let mut guard = self.resolve_entity_write(&series_id).await?;
        if !guard.series.contains_key(&series_id) {
            return Err(EngineError::NotFound(series_id));
        }
        let event = Event::SeriesPaymentChanged {
            id: series_id,
            court_id: guard.court.id,
            payment_status,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        guard
            .series
            .get(&series_id)
            .cloned()
            .ok_or(EngineError::NotFound(series_id))
    }

    /// Move every pending or confirmed member to `active`, once payment is in.
    ///
    /// Conflicts with anything outside the series are collected first. Unless
    /// `skip_conflict_check` is set they block the whole activation and the
    /// report comes back with `blocked`; nothing changes in that case.
    pub async fn activate_series(
        &self,
        req: ActivateSeriesRequest,
    ) -> Result<ActivationReport, EngineError> {
        let series_id = req.series_id;
        let mut guard = self.resolve_entity_write(&series_id).await?;
        let series = guard
            .series
            .get(&series_id)
            .cloned()
            .ok_or(EngineError::NotFound(series_id))?;
        if series.payment_status != PaymentStatus::Paid {
            metrics::counter!(crate::observability::SERIES_ACTIVATIONS_TOTAL, "result" => "unpaid")
                .increment(1);
            return Err(EngineError::PaymentNotConfirmed(series_id));
        }

        let eligible: Vec<Booking> = guard
            .series_members(&series_id)
            .into_iter()
            .filter(|b| matches!(b.status, BookingStatus::Pending | BookingStatus::Confirmed))
            .cloned()
            .collect();

        let mut report = ActivationReport::default();
        for member in &eligible {
            for conflict in find_conflicts(&guard, &member.span, Some(member.id), Some(series_id)) {
                report.conflicts.push(SeriesConflict {
                    booking_id: member.id,
                    date: date_of(member.span.start),
                    start: member.span.start,
                    end: member.span.end,
                    court_id: member.court_id,
                    conflict,
                });
            }
        }

        if !report.conflicts.is_empty() && !req.skip_conflict_check {
            report.blocked = true;
            metrics::counter!(crate::observability::SERIES_ACTIVATIONS_TOTAL, "result" => "blocked")
                .increment(1);
            tracing::warn!(
                "series {series_id} activation blocked by {} conflicts",
                report.conflicts.len()
            );
            return Ok(report);
        }
        if eligible.is_empty() {
            return Ok(report);
        }

        let booking_ids: Vec<Ulid> = eligible.iter().map(|b| b.id).collect();
        let event = Event::SeriesStatusChanged {
            id: series_id,
            court_id: guard.court.id,
            booking_ids: booking_ids.clone(),
            status: BookingStatus::Active,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::SERIES_ACTIVATIONS_TOTAL, "result" => "activated")
            .increment(1);
        if !report.conflicts.is_empty() {
            tracing::warn!(
                "series {series_id} activated over {} conflicts",
                report.conflicts.len()
            );
        }
        tracing::info!("series {series_id}: {} bookings active", booking_ids.len());
        report.activated = booking_ids;
        Ok(report)
    }

    /// Cancel every occupying member in one step, then offer each freed
    /// occurrence to its waitlist.
    pub async fn cancel_series(
        &self,
        series_id: Ulid,
        actor: &Actor,
    ) -> Result<SeriesCancelOutcome, EngineError> {
        let mut guard = self.resolve_entity_write(&series_id).await?;
        if !guard.series.contains_key(&series_id) {
            return Err(EngineError::NotFound(series_id));
        }
        let live: Vec<(Ulid, Span)> = guard
            .series_members(&series_id)
            .into_iter()
            .filter(|b| b.status.is_occupying())
            .map(|b| (b.id, b.span))
            .collect();
        let mut outcome = SeriesCancelOutcome::default();
        if live.is_empty() {
            return Ok(outcome);
        }

        let now = now_ms();
        let event = Event::SeriesStatusChanged {
            id: series_id,
            court_id: guard.court.id,
            booking_ids: live.iter().map(|(id, _)| *id).collect(),
            status: BookingStatus::Cancelled,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::BOOKINGS_CANCELLED_TOTAL).increment(live.len() as u64);
        tracing::info!(
            "series {series_id}: {} bookings cancelled by {}",
            live.len(),
            actor.id()
        );

        for (id, span) in live {
            outcome.cancelled.push(id);
            if let Some(promoted) = self.promote_next(&mut guard, span, now).await? {
                outcome.promoted.push(promoted);
            }
        }
        Ok(outcome)
    }

    pub async fn get_series(&self, series_id: &Ulid) -> Option<(Series, Vec<Booking>)> {
        let court_id = self.store.court_for_entity(series_id)?;
        let cs = self.store.get_court(&court_id)?;
        let guard = cs.read().await;
        let series = guard.series.get(series_id)?.clone();
        let members = guard
            .series_members(series_id)
            .into_iter()
            .cloned()
            .collect();
        Some((series, members))
    }
}
