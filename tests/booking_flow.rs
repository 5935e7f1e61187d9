use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use ulid::Ulid;

use courtside::config::EngineConfig;
use courtside::engine::{Conflict, Engine, EngineError};
use courtside::model::*;
use courtside::notify::{Channel, MemoryNotifier};
use courtside::requests::*;
use courtside::tenant::TenantManager;

const H: Ms = 3_600_000;
/// 2030-03-04T00:00:00Z, a Monday
const MONDAY: Ms = 1_898_812_800_000;

// ── Test infrastructure ──────────────────────────────────────

fn data_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("courtside_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn tenants(dir: PathBuf, notifier: Arc<MemoryNotifier>) -> TenantManager {
    let config = EngineConfig {
        waitlist_depth: 2,
        reservation_base_url: "https://book.riverside.example/".into(),
        ..EngineConfig::default()
    };
    TenantManager::new(dir, config, notifier)
}

async fn open_court(engine: &Engine, name: &str) -> Court {
    let court = Court {
        id: Ulid::new(),
        facility_id: Ulid::new(),
        name: name.into(),
        facility_name: "Riverside Tennis".into(),
    };
    engine.create_court(court.clone()).await.unwrap();
    court
}

fn book(court: &Court, span: Span, user: &str) -> CreateBookingRequest {
    CreateBookingRequest {
        court_id: court.id,
        span,
        actor: Actor::Customer { id: user.into() },
        user_id: Some(user.into()),
        contact: None,
        notes: None,
        price_cents: Some(3000),
        payment_status: PaymentStatus::Pending,
    }
}

fn wait_for_slot(court: &Court, span: Span, email: &str) -> JoinWaitlistRequest {
    JoinWaitlistRequest {
        court_id: court.id,
        span,
        user_id: None,
        contact: Contact {
            name: "Guest".into(),
            email: email.into(),
            phone: None,
        },
    }
}

fn token_from(link: &str) -> String {
    link.rsplit('/').next().unwrap().to_string()
}

// ── Scenarios ────────────────────────────────────────────────

#[tokio::test]
async fn freed_slot_reaches_waitlist_through_the_link() {
    let notifier = Arc::new(MemoryNotifier::new());
    let tm = tenants(data_dir(), notifier.clone());
    let engine = tm.get_or_create("riverside").unwrap();
    let court = open_court(&engine, "Court 1").await;

    let span = Span::new(MONDAY + 18 * H, MONDAY + 19 * H);
    let booking = engine.create_booking(book(&court, span, "ana")).await.unwrap();
    engine
        .join_waitlist(wait_for_slot(&court, span, "ben@example.com"))
        .await
        .unwrap();
    engine
        .join_waitlist(wait_for_slot(&court, span, "cy@example.com"))
        .await
        .unwrap();

    engine
        .cancel_booking(booking.id, &Actor::Customer { id: "ana".into() })
        .await
        .unwrap();
    assert!(notifier.wait_for(1, Duration::from_secs(2)).await);

    let offer = &notifier.sent()[0];
    assert_eq!(offer.channel, Channel::Email);
    assert_eq!(offer.recipient, "ben@example.com");
    assert!(
        offer
            .template
            .reservation_link
            .starts_with("https://book.riverside.example/reserve/")
    );

    let token = token_from(&offer.template.reservation_link);
    let outcome = engine.redeem_reservation(&token).await.unwrap();
    let booking_id = outcome.booking_id().unwrap();
    assert_eq!(outcome.message(), "Your booking is confirmed.");

    // the slot is held again, so the second waiter stays queued
    let conflicts = engine.conflicts(court.id, span, None, None).await.unwrap();
    assert_eq!(conflicts, vec![Conflict::Booking(booking_id)]);
    let queue = engine
        .list_waitlist(court.id, Some(span), chrono::Utc::now().timestamp_millis())
        .await
        .unwrap();
    assert_eq!(queue[1].status, WaitlistStatus::Waitlist);
    assert_eq!(notifier.sent().len(), 1);
}

#[tokio::test]
async fn season_booking_end_to_end() {
    let notifier = Arc::new(MemoryNotifier::new());
    let tm = tenants(data_dir(), notifier);
    let engine = tm.get_or_create("league_club").unwrap();
    let court = open_court(&engine, "Court 4").await;

    let (series, members) = engine
        .create_series(CreateSeriesRequest {
            court_id: court.id,
            start_date: NaiveDate::from_ymd_opt(2030, 3, 4).unwrap(),
            end_date: NaiveDate::from_ymd_opt(2030, 5, 27).unwrap(),
            day_of_week: 1,
            start_time: "19:00".into(),
            end_time: "20:30".into(),
            actor: Actor::Staff { id: "desk".into() },
            user_id: None,
            contact: Some(Contact {
                name: "Monday Ladder".into(),
                email: "ladder@example.com".into(),
                phone: Some("+15550123".into()),
            }),
            notes: None,
            price_cents: Some(120_000),
        })
        .await
        .unwrap();
    assert_eq!(members.len(), 13);
    assert_eq!(members[0].span.start, MONDAY + 19 * H);

    // nobody else can take a league night
    let clash = engine
        .create_booking(book(&court, Span::new(MONDAY + 19 * H, MONDAY + 20 * H), "dee"))
        .await;
    assert_eq!(clash, Err(EngineError::SlotConflict(members[0].id)));

    engine
        .set_series_payment(series.id, PaymentStatus::Paid)
        .await
        .unwrap();
    let report = engine
        .activate_series(ActivateSeriesRequest {
            series_id: series.id,
            skip_conflict_check: false,
        })
        .await
        .unwrap();
    assert_eq!(report.activated.len(), 13);

    let outcome = engine
        .cancel_series(series.id, &Actor::Staff { id: "desk".into() })
        .await
        .unwrap();
    assert_eq!(outcome.cancelled.len(), 13);
    assert!(outcome.promoted.is_empty());
}

#[tokio::test]
async fn tenants_restart_from_their_wal() {
    let dir = data_dir();
    let span = Span::new(MONDAY + 7 * H, MONDAY + 8 * H);

    let (court, booking_id) = {
        let tm = tenants(dir.clone(), Arc::new(MemoryNotifier::new()));
        let engine = tm.get_or_create("north").unwrap();
        let court = open_court(&engine, "Court 9").await;
        let b = engine.create_booking(book(&court, span, "eli")).await.unwrap();
        engine.confirm_booking(b.id).await.unwrap();

        // another tenant with the same court id stays independent
        let other = tm.get_or_create("south").unwrap();
        other.create_court(court.clone()).await.unwrap();
        (court, b.id)
    };

    let tm = tenants(dir, Arc::new(MemoryNotifier::new()));
    let north = tm.get_or_create("north").unwrap();
    let restored = north.get_booking(&booking_id).await.unwrap();
    assert_eq!(restored.status, BookingStatus::Confirmed);
    assert_eq!(
        north.create_booking(book(&court, span, "fay")).await,
        Err(EngineError::SlotConflict(booking_id))
    );

    let south = tm.get_or_create("south").unwrap();
    assert!(south.get_booking(&booking_id).await.is_none());
    south.create_booking(book(&court, span, "fay")).await.unwrap();
}
