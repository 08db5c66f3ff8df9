use super::*;
use crate::clock::ManualClock;
use crate::payments::{ChannelPayments, PaymentEvent};
use crate::store::Store;
use crate::window;

use std::path::PathBuf;

use chrono::{NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const M: Ms = MINUTE_MS;
const S: Ms = 1_000;

fn t(h: u32, m: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(h, m, 0).unwrap()
}

fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
}

fn at(time: NaiveTime) -> Ms {
    window::at(monday(), time)
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("venuebook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn hall(rules: BookingRules) -> Space {
    Space {
        id: Ulid::new(),
        owner_id: Ulid::new(),
        name: "Main Hall".into(),
        category: "event".into(),
        capacity: 40,
        hours: WeeklyHours::every_day(t(9, 0), t(18, 0)),
        blackout_dates: vec![],
        pricing: PricingConfig::hourly(dec!(100), "USD"),
        rules,
        cancellation_policy: CancellationPolicy::default(),
        stats: SpaceStats::default(),
    }
}

struct Fixture {
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    space: Space,
}

async fn fixture_with(store: Arc<dyn crate::store::RecordStore>, rules: BookingRules) -> Fixture {
    let clock = Arc::new(ManualClock::new(at(t(8, 0))));
    let engine = Engine::new(store, clock.clone(), TokenSigner::new("test-secret", 24 * HOUR_MS));
    let space = hall(rules);
    engine.upsert_space(space.clone()).await.unwrap();
    Fixture {
        engine: Arc::new(engine),
        clock,
        space,
    }
}

async fn fixture() -> Fixture {
    fixture_with(Arc::new(Store::in_memory()), BookingRules::default()).await
}

fn slot(space: &Space, start: NaiveTime, end: NaiveTime) -> SlotRequest {
    SlotRequest {
        space_id: space.id,
        date: monday(),
        start,
        end,
    }
}

fn request(space: &Space, start: NaiveTime, end: NaiveTime) -> BookingRequest {
    BookingRequest {
        slot: slot(space, start, end),
        customer_id: Ulid::new(),
        promo_code: None,
        attendees: 4,
        notes: None,
    }
}

fn promo(code: &str, limit: Option<u32>) -> PromoCode {
    PromoCode {
        code: code.into(),
        discount_type: DiscountType::Percentage,
        value: dec!(10),
        min_order_amount: None,
        max_discount_amount: None,
        valid_from: 0,
        valid_until: at(t(23, 0)),
        usage_limit: limit,
        used_count: 0,
        is_active: true,
    }
}

async fn confirmed(f: &Fixture, start: NaiveTime, end: NaiveTime) -> Booking {
    let b = f.engine.create_booking(request(&f.space, start, end)).await.unwrap();
    f.engine.apply_payment_event(b.id, PaymentEvent::Paid).await.unwrap()
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn conflict_cites_existing_booking() {
    let f = fixture().await;
    let a = confirmed(&f, t(10, 0), t(12, 0)).await;

    let err = f
        .engine
        .create_booking(request(&f.space, t(11, 0), t(13, 0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(matches!(&err, EngineError::Conflict { booking_code } if *booking_code == a.code));

    let verdict = f.engine.check_availability(&slot(&f.space, t(12, 0), t(13, 0))).await.unwrap();
    assert!(verdict.is_eligible());
    f.engine
        .create_booking(request(&f.space, t(12, 0), t(13, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn buffer_pads_both_sides() {
    let rules = BookingRules {
        buffer_minutes: 15,
        ..BookingRules::default()
    };
    let f = fixture_with(Arc::new(Store::in_memory()), rules).await;
    confirmed(&f, t(12, 0), t(14, 0)).await;

    for (start, end) in [(t(14, 0), t(15, 0)), (t(11, 0), t(11, 50))] {
        let err = f.engine.create_booking(request(&f.space, start, end)).await.unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }), "{start}-{end}");
    }
    f.engine
        .create_booking(request(&f.space, t(14, 15), t(15, 0)))
        .await
        .unwrap();
    f.engine
        .create_booking(request(&f.space, t(11, 0), t(11, 45)))
        .await
        .unwrap();
}

#[tokio::test]
async fn unavailable_reasons_are_validation_errors() {
    let rules = BookingRules {
        min_advance_minutes: 120,
        max_duration_minutes: Some(240),
        ..BookingRules::default()
    };
    let mut space_fixture = fixture_with(Arc::new(Store::in_memory()), rules).await;
    let mut space = space_fixture.space.clone();
    space.blackout_dates.push(NaiveDate::from_ymd_opt(2026, 10, 20).unwrap());
    space_fixture.engine.upsert_space(space.clone()).await.unwrap();
    space_fixture.space = space;
    let f = space_fixture;

    // 08:00 now, 09:00 start: one hour of notice against two required
    let err = f.engine.create_booking(request(&f.space, t(9, 0), t(10, 0))).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Unavailable(Unavailability::InsufficientNotice { .. })
    ));
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = f.engine.create_booking(request(&f.space, t(17, 0), t(19, 0))).await.unwrap_err();
    assert!(matches!(err, EngineError::Unavailable(Unavailability::Hours(_))));

    let err = f.engine.create_booking(request(&f.space, t(10, 0), t(15, 0))).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Unavailable(Unavailability::DurationOutOfRange { .. })
    ));

    let mut blackout = request(&f.space, t(10, 0), t(11, 0));
    blackout.slot.date = NaiveDate::from_ymd_opt(2026, 10, 20).unwrap();
    let err = f.engine.create_booking(blackout).await.unwrap_err();
    assert!(matches!(err, EngineError::Unavailable(Unavailability::Hours(_))));

    let mut crowd = request(&f.space, t(12, 0), t(13, 0));
    crowd.attendees = 41;
    assert!(matches!(
        f.engine.create_booking(crowd).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn unknown_space_is_not_found() {
    let f = fixture().await;
    let mut req = request(&f.space, t(10, 0), t(11, 0));
    req.slot.space_id = Ulid::new();
    let err = f.engine.create_booking(req).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn suggestions_skip_booked_windows() {
    let f = fixture().await;
    confirmed(&f, t(10, 0), t(12, 0)).await;
    confirmed(&f, t(14, 0), t(17, 0)).await;
    let free = f.engine.suggest_slots(f.space.id, monday(), 120).await.unwrap();
    assert_eq!(free, vec![Span::new(at(t(12, 0)), at(t(14, 0)))]);
    let free = f.engine.suggest_slots(f.space.id, monday(), 60).await.unwrap();
    assert_eq!(free.len(), 3);
}

#[tokio::test]
async fn late_buffer_reaches_into_next_morning() {
    let rules = BookingRules {
        buffer_minutes: 60,
        ..BookingRules::default()
    };
    let mut f = fixture_with(Arc::new(Store::in_memory()), rules).await;
    f.space.hours = WeeklyHours::every_day(t(0, 0), t(23, 59));
    f.engine.upsert_space(f.space.clone()).await.unwrap();
    let sunday = NaiveDate::from_ymd_opt(2026, 10, 18).unwrap();
    f.clock.set(window::at(sunday, t(8, 0)));

    let mut late = request(&f.space, t(22, 59), t(23, 59));
    late.slot.date = sunday;
    let late = f.engine.create_booking(late).await.unwrap();

    // Sunday 23:59 plus an hour of buffer covers Monday until 00:59.
    let verdict = f.engine.check_availability(&slot(&f.space, t(0, 0), t(1, 0))).await.unwrap();
    assert_eq!(
        verdict,
        Availability::Unavailable(Unavailability::Conflict {
            booking_code: late.code.clone()
        })
    );
    let free = f.engine.suggest_slots(f.space.id, monday(), 60).await.unwrap();
    assert_eq!(free[0].start, at(t(0, 59)));
    f.engine
        .create_booking(request(&f.space, t(0, 59), t(1, 59)))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_creates_admit_one() {
    let f = fixture().await;
    let mut handles = Vec::new();
    for i in 0..16u32 {
        let engine = f.engine.clone();
        let mut req = request(&f.space, t(10, 0), t(12, 0));
        // Different but overlapping windows
        req.slot.start = t(10, i % 4 * 10);
        handles.push(tokio::spawn(async move { engine.create_booking(req).await }));
    }
    let results = futures::future::join_all(handles).await;
    let mut ok = 0;
    for r in results {
        match r.unwrap() {
            Ok(_) => ok += 1,
            Err(e) => assert!(matches!(e, EngineError::Conflict { .. }), "{e}"),
        }
    }
    assert_eq!(ok, 1);

    let active = f
        .engine
        .list_bookings(&BookingFilter::active_on(f.space.id, monday()))
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
}

// ── Pricing ──────────────────────────────────────────────

#[tokio::test]
async fn quote_is_repeatable_and_side_effect_free() {
    let f = fixture().await;
    f.engine.upsert_promo(promo("SAVE10", Some(1))).await.unwrap();
    let req = slot(&f.space, t(10, 0), t(12, 0));
    let a = f.engine.price_quote(&req, Some("save10")).await.unwrap();
    let b = f.engine.price_quote(&req, Some("save10")).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(a.base_amount, dec!(200));
    assert_eq!(a.total_amount, dec!(180));
    let stored = f.engine.store.find_promo("SAVE10").await.unwrap().unwrap();
    assert_eq!(stored.used_count, 0);
}

#[tokio::test]
async fn booking_carries_discounted_pricing() {
    let f = fixture().await;
    f.engine.upsert_promo(promo("save10", None)).await.unwrap();
    let mut req = request(&f.space, t(10, 0), t(12, 0));
    req.promo_code = Some(" Save10 ".into());
    let b = f.engine.create_booking(req).await.unwrap();
    assert_eq!(b.status, BookingStatus::Pending);
    assert_eq!(b.pricing.promo_code.as_deref(), Some("SAVE10"));
    assert_eq!(b.pricing.total_amount, dec!(180));
    let stored = f.engine.store.find_promo("SAVE10").await.unwrap().unwrap();
    assert_eq!(stored.used_count, 1);
}

// ── Promo guard ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_redemptions_respect_limit() {
    let f = fixture().await;
    f.engine.upsert_promo(promo("LIMITED", Some(5))).await.unwrap();

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let engine = f.engine.clone();
            tokio::spawn(async move { engine.redeem_promo("limited").await })
        })
        .collect();
    let mut ok = 0;
    let mut exhausted = 0;
    for r in futures::future::join_all(handles).await {
        match r.unwrap() {
            Ok(_) => ok += 1,
            Err(EngineError::PromoExhausted(_)) => exhausted += 1,
            Err(e) => panic!("unexpected: {e}"),
        }
    }
    assert_eq!(ok, 5);
    assert_eq!(exhausted, 15);
    let stored = f.engine.store.find_promo("LIMITED").await.unwrap().unwrap();
    assert_eq!(stored.used_count, 5);
}

#[tokio::test]
async fn promo_edit_keeps_consumed_uses() {
    let f = fixture().await;
    let original = promo("TWICE", Some(2));
    f.engine.upsert_promo(original.clone()).await.unwrap();
    f.engine.redeem_promo("TWICE").await.unwrap();
    f.engine.redeem_promo("TWICE").await.unwrap();

    let mut extended = original.clone();
    extended.valid_until += HOUR_MS;
    f.engine.upsert_promo(extended).await.unwrap();
    let mut redeemed = 0;
    for _ in 0..2 {
        if f.engine.redeem_promo("TWICE").await.is_ok() {
            redeemed += 1;
        }
    }
    assert_eq!(redeemed, 0);
    let stored = f.engine.store.find_promo("TWICE").await.unwrap().unwrap();
    assert_eq!(stored.used_count, 2);
    assert_eq!(stored.valid_until, at(t(23, 0)) + HOUR_MS);

    let mut shrunk = original.clone();
    shrunk.usage_limit = Some(1);
    assert!(matches!(
        f.engine.upsert_promo(shrunk).await,
        Err(EngineError::Validation(_))
    ));
}

#[tokio::test]
async fn promo_amounts_are_bounded() {
    let f = fixture().await;
    let mut p = promo("NEG", None);
    p.min_order_amount = Some(dec!(-5));
    assert!(matches!(f.engine.upsert_promo(p).await, Err(EngineError::Validation(_))));
    let mut p = promo("NEG", None);
    p.max_discount_amount = Some(dec!(-1));
    assert!(matches!(f.engine.upsert_promo(p).await, Err(EngineError::Validation(_))));
    let mut p = promo("HUGE", None);
    p.discount_type = DiscountType::Fixed;
    p.value = Decimal::MAX;
    assert!(matches!(f.engine.upsert_promo(p).await, Err(EngineError::Validation(_))));
    let mut p = promo("OVER", None);
    p.value = dec!(101);
    assert!(matches!(f.engine.upsert_promo(p).await, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn promo_errors_by_kind() {
    let f = fixture().await;
    let err = f.engine.lookup_promo("NOPE").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let mut expired = promo("OLD", None);
    expired.valid_until = at(t(7, 0));
    f.engine.upsert_promo(expired).await.unwrap();
    let err = f.engine.redeem_promo("OLD").await.unwrap_err();
    assert!(matches!(err, EngineError::PromoNotRedeemable { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);

    f.engine.upsert_promo(promo("ONCE", Some(1))).await.unwrap();
    f.engine.redeem_promo("ONCE").await.unwrap();
    let mut req = request(&f.space, t(10, 0), t(11, 0));
    req.promo_code = Some("ONCE".into());
    let err = f.engine.create_booking(req).await.unwrap_err();
    assert!(matches!(err, EngineError::PromoExhausted(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    // the failed create left nothing behind
    let all = f.engine.list_bookings(&BookingFilter::default()).await.unwrap();
    assert!(all.is_empty());
}

#[tokio::test]
async fn below_min_order_does_not_consume() {
    let f = fixture().await;
    let mut p = promo("BIG", Some(1));
    p.min_order_amount = Some(dec!(1000));
    f.engine.upsert_promo(p).await.unwrap();
    let mut req = request(&f.space, t(10, 0), t(11, 0));
    req.promo_code = Some("BIG".into());
    let b = f.engine.create_booking(req).await.unwrap();
    assert_eq!(b.pricing.discount_amount, Decimal::ZERO);
    assert_eq!(b.pricing.promo_code, None);
    let stored = f.engine.store.find_promo("BIG").await.unwrap().unwrap();
    assert_eq!(stored.used_count, 0);
}

#[tokio::test]
async fn conflicting_create_consumes_no_promo_use() {
    let f = fixture().await;
    f.engine.upsert_promo(promo("ONE", Some(1))).await.unwrap();
    confirmed(&f, t(10, 0), t(12, 0)).await;
    let mut req = request(&f.space, t(11, 0), t(12, 0));
    req.promo_code = Some("ONE".into());
    assert!(f.engine.create_booking(req).await.is_err());
    let stored = f.engine.store.find_promo("ONE").await.unwrap().unwrap();
    assert_eq!(stored.used_count, 0);
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn payment_events() {
    let f = fixture().await;
    let b = f.engine.create_booking(request(&f.space, t(10, 0), t(11, 0))).await.unwrap();

    let failed = f.engine.apply_payment_event(b.id, PaymentEvent::Failed).await.unwrap();
    assert_eq!(failed.status, BookingStatus::Pending);
    assert_eq!(failed.payment_status, PaymentStatus::Failed);

    let paid = f.engine.apply_payment_event(b.id, PaymentEvent::Paid).await.unwrap();
    assert_eq!(paid.status, BookingStatus::Confirmed);
    assert_eq!(paid.payment_status, PaymentStatus::Paid);

    // duplicate callback
    let again = f.engine.apply_payment_event(b.id, PaymentEvent::Paid).await.unwrap();
    assert_eq!(again, paid);

    let err = f.engine.apply_payment_event(b.id, PaymentEvent::Failed).await.unwrap_err();
    assert!(matches!(err, EngineError::PaymentNotApplicable { .. }));

    let refunded = f.engine.apply_payment_event(b.id, PaymentEvent::Refunded).await.unwrap();
    assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
    assert_eq!(refunded.status, BookingStatus::Confirmed);
}

#[tokio::test]
async fn check_in_window_boundaries() {
    let f = fixture().await;
    let early = confirmed(&f, t(10, 0), t(11, 0)).await;
    let late = confirmed(&f, t(13, 0), t(14, 0)).await;
    let edge = confirmed(&f, t(15, 0), t(16, 0)).await;
    let staff = Ulid::new();

    f.clock.set(at(t(9, 45)) - S);
    let err = f.engine.check_in_booking(early.id, staff).await.unwrap_err();
    assert!(matches!(err, EngineError::CheckInTooEarly { .. }));
    assert_eq!(err.kind(), ErrorKind::Eligibility);
    f.clock.set(at(t(9, 45)));
    let b = f.engine.check_in_booking(early.id, staff).await.unwrap();
    assert_eq!(b.status, BookingStatus::CheckedIn);
    assert_eq!(b.checked_in_at, Some(at(t(9, 45))));
    assert_eq!(b.checked_in_by, Some(staff));

    f.clock.set(at(t(13, 30)) + S);
    let err = f.engine.check_in_booking(late.id, staff).await.unwrap_err();
    assert!(matches!(err, EngineError::CheckInWindowClosed { .. }));

    f.clock.set(at(t(15, 30)));
    f.engine.check_in_booking(edge.id, staff).await.unwrap();
}

#[tokio::test]
async fn check_out_of_pending_is_rejected() {
    let f = fixture().await;
    let b = f.engine.create_booking(request(&f.space, t(10, 0), t(11, 0))).await.unwrap();
    let err = f.engine.check_out_booking(b.id, Ulid::new()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: BookingStatus::Pending,
            to: BookingStatus::CheckedOut
        }
    ));
    assert_eq!(err.kind(), ErrorKind::Eligibility);
    let err = f.engine.check_in_booking(b.id, Ulid::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
}

#[tokio::test]
async fn full_lifecycle_through_tokens() {
    let f = fixture().await;
    let mut events = f.engine.notify.subscribe(f.space.id);
    let b = confirmed(&f, t(10, 0), t(12, 0)).await;
    let token = f.engine.issue_token(b.id).await.unwrap();
    let staff = Ulid::new();

    let check = f.engine.validate_token(&token).await.unwrap();
    assert_eq!(check.booking_id, b.id);
    assert!(!check.can_check_in);
    assert!(!check.can_check_out);

    f.clock.set(at(t(10, 5)));
    let check = f.engine.validate_token(&token).await.unwrap();
    assert!(check.can_check_in);
    f.engine.check_in(&token, staff).await.unwrap();

    f.clock.set(at(t(11, 55)));
    let check = f.engine.validate_token(&token).await.unwrap();
    assert!(!check.can_check_in);
    assert!(check.can_check_out);
    let done = f.engine.check_out(&token, staff).await.unwrap();
    assert_eq!(done.status, BookingStatus::Completed);
    assert_eq!(done.checked_out_at, Some(at(t(11, 55))));

    let mut seen = Vec::new();
    while let Ok(ev) = events.try_recv() {
        seen.push((ev.from, ev.to));
    }
    assert_eq!(
        seen,
        vec![
            (None, BookingStatus::Pending),
            (Some(BookingStatus::Pending), BookingStatus::Confirmed),
            (Some(BookingStatus::Confirmed), BookingStatus::CheckedIn),
            (Some(BookingStatus::CheckedIn), BookingStatus::CheckedOut),
            (Some(BookingStatus::CheckedOut), BookingStatus::Completed),
        ]
    );

    let space = f.engine.find_space(f.space.id).await.unwrap().unwrap();
    assert_eq!(space.stats.completed, 1);
    assert_eq!(space.stats.active_check_ins, 0);
}

#[tokio::test]
async fn token_expires_after_a_day() {
    let f = fixture().await;
    let b = confirmed(&f, t(10, 0), t(12, 0)).await;
    let issued = f.engine.now();
    let token = f.engine.issue_token(b.id).await.unwrap();

    f.clock.set(issued + 23 * HOUR_MS + 59 * M);
    f.engine.validate_token(&token).await.unwrap();

    f.clock.set(issued + 24 * HOUR_MS + M);
    let err = f.engine.validate_token(&token).await.unwrap_err();
    assert!(matches!(err, EngineError::ExpiredToken { .. }));
    assert_eq!(err.kind(), ErrorKind::ExpiredToken);
}

#[tokio::test]
async fn tokens_only_for_confirmed_and_revoked_on_cancel() {
    let f = fixture().await;
    let pending = f.engine.create_booking(request(&f.space, t(13, 0), t(14, 0))).await.unwrap();
    assert!(matches!(
        f.engine.issue_token(pending.id).await,
        Err(EngineError::TokenNotIssuable(BookingStatus::Pending))
    ));

    let b = confirmed(&f, t(10, 0), t(12, 0)).await;
    let token = f.engine.issue_token(b.id).await.unwrap();
    f.engine.cancel(b.id, "plans changed").await.unwrap();
    assert!(matches!(
        f.engine.validate_token(&token).await,
        Err(EngineError::TokenRevoked(_))
    ));
}

#[tokio::test]
async fn foreign_token_fails_signature() {
    let f = fixture().await;
    let b = confirmed(&f, t(10, 0), t(12, 0)).await;
    let other = TokenSigner::new("another-secret", 24 * HOUR_MS);
    let forged = other
        .sign(TokenClaims {
            booking_code: b.code.clone(),
            space_id: b.space_id,
            customer_id: b.customer_id,
            issued_at: 0,
            expires_at: i64::MAX,
        })
        .unwrap();
    let err = f.engine.check_in(&forged, Ulid::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Signature);
}

#[tokio::test]
async fn cancel_paid_booking_requests_refund() {
    let (payments, mut refunds) = ChannelPayments::new();
    let clock = Arc::new(ManualClock::new(at(t(8, 0))));
    let engine = Engine::new(
        Arc::new(Store::in_memory()),
        clock,
        TokenSigner::new("k", HOUR_MS),
    )
    .with_payments(Arc::new(payments));
    let mut space = hall(BookingRules::default());
    space.cancellation_policy.partial_refund_percent = dec!(50);
    engine.upsert_space(space.clone()).await.unwrap();

    let b = engine.create_booking(request(&space, t(10, 0), t(12, 0))).await.unwrap();
    engine.apply_payment_event(b.id, PaymentEvent::Paid).await.unwrap();
    let cancelled = engine.cancel(b.id, "  venue double-booked offline ").await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    let c = cancelled.cancellation.unwrap();
    assert_eq!(c.reason, "venue double-booked offline");
    assert_eq!(c.at, at(t(8, 0)));

    let refund = refunds.try_recv().unwrap();
    assert_eq!(refund.booking_id, b.id);
    assert_eq!(refund.amount_paid, dec!(200));
    assert_eq!(refund.policy.partial_refund_percent, dec!(50));

    let err = engine.cancel(b.id, "again").await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: BookingStatus::Cancelled,
            ..
        }
    ));
    let stats = engine.find_space(space.id).await.unwrap().unwrap().stats;
    assert_eq!(stats.cancellations, 1);

    // unpaid cancellations never reach the collaborator
    let unpaid = engine.create_booking(request(&space, t(13, 0), t(14, 0))).await.unwrap();
    engine.cancel(unpaid.id, "no longer needed").await.unwrap();
    assert!(refunds.try_recv().is_err());
}

#[tokio::test]
async fn cancelled_window_can_be_rebooked() {
    let f = fixture().await;
    let b = confirmed(&f, t(10, 0), t(12, 0)).await;
    f.engine.cancel(b.id, "sick").await.unwrap();
    f.engine
        .create_booking(request(&f.space, t(10, 0), t(12, 0)))
        .await
        .unwrap();
}

#[tokio::test]
async fn sweep_marks_no_shows_after_grace() {
    let f = fixture().await;
    let b = confirmed(&f, t(10, 0), t(12, 0)).await;

    let report = f.engine.sweep(at(t(10, 30))).await.unwrap();
    assert!(report.no_shows.is_empty());
    f.clock.set(at(t(10, 30)));
    assert!(matches!(
        f.engine.mark_no_show(b.id).await,
        Err(EngineError::GraceWindowOpen { .. })
    ));

    let report = f.engine.sweep(at(t(10, 31))).await.unwrap();
    assert_eq!(report.no_shows, vec![b.code.clone()]);
    assert_eq!(report.failures, 0);
    let stored = f.engine.find_booking(b.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::NoShow);

    // idempotent
    let report = f.engine.sweep(at(t(11, 0))).await.unwrap();
    assert!(report.no_shows.is_empty());
    let stats = f.engine.find_space(f.space.id).await.unwrap().unwrap().stats;
    assert_eq!(stats.no_shows, 1);
}

#[tokio::test]
async fn sweep_expires_unpaid_pending() {
    let rules = BookingRules {
        payment_window_minutes: Some(15),
        ..BookingRules::default()
    };
    let f = fixture_with(Arc::new(Store::in_memory()), rules).await;
    let b = f.engine.create_booking(request(&f.space, t(10, 0), t(12, 0))).await.unwrap();

    let report = f.engine.sweep(at(t(8, 15))).await.unwrap();
    assert!(report.expired_pending.is_empty());
    let report = f.engine.sweep(at(t(8, 16))).await.unwrap();
    assert_eq!(report.expired_pending, vec![b.code.clone()]);

    let stored = f.engine.find_booking(b.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BookingStatus::Cancelled);
    assert_eq!(
        stored.cancellation.map(|c| c.reason),
        Some("payment window elapsed".to_string())
    );
}

#[tokio::test]
async fn space_validation() {
    let f = fixture().await;
    let mut bad = hall(BookingRules::default());
    bad.capacity = 0;
    assert!(matches!(f.engine.upsert_space(bad).await, Err(EngineError::Validation(_))));
    let mut bad = hall(BookingRules::default());
    bad.hours = WeeklyHours::every_day(t(18, 0), t(9, 0));
    assert!(matches!(f.engine.upsert_space(bad).await, Err(EngineError::Validation(_))));
}

#[tokio::test]
async fn pricing_amounts_are_bounded() {
    let f = fixture().await;
    let cases: [fn(&mut PricingConfig); 8] = [
        |p| p.base_price = Decimal::MAX,
        |p| p.base_price = dec!(-1),
        |p| p.tax_percent = dec!(150),
        |p| p.weekend_multiplier = Some(dec!(-1)),
        |p| {
            p.peak_hours = Some(PeakHours {
                start: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                end: NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                multiplier: dec!(-2),
            })
        },
        |p| {
            p.time_blocks.push(TimeBlock {
                name: "Morning".into(),
                duration_minutes: 120,
                price: dec!(-50),
            })
        },
        |p| {
            p.special_events.push(SpecialEventRate {
                date: NaiveDate::from_ymd_opt(2026, 10, 19).unwrap(),
                name: "Launch".into(),
                rate: dec!(-10),
            })
        },
        |p| {
            p.monthly_pass = Some(MonthlyPass {
                price: dec!(-400),
                valid_days: 30,
            })
        },
    ];
    for (i, mutate) in cases.into_iter().enumerate() {
        let mut space = hall(BookingRules::default());
        mutate(&mut space.pricing);
        let id = space.id;
        assert!(
            matches!(f.engine.upsert_space(space).await, Err(EngineError::Validation(_))),
            "case {i}"
        );
        // Rejected spaces never reach the quote path.
        let req = SlotRequest {
            space_id: id,
            ..slot(&f.space, t(10, 0), t(12, 0))
        };
        assert!(matches!(
            f.engine.price_quote(&req, None).await,
            Err(EngineError::SpaceNotFound(_))
        ));
    }

    let mut top = hall(BookingRules::default());
    top.pricing.base_price = crate::limits::MAX_AMOUNT;
    top.pricing.weekend_multiplier = Some(crate::limits::MAX_MULTIPLIER);
    top.pricing.tax_percent = Decimal::ONE_HUNDRED;
    f.engine.upsert_space(top.clone()).await.unwrap();
    let q = f
        .engine
        .price_quote(&slot(&top, t(9, 0), t(18, 0)), None)
        .await
        .unwrap();
    assert!(q.total_amount > Decimal::ZERO);
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_wal_path("engine_reopen.wal");
    let (booking, space_id) = {
        let store = Arc::new(Store::open(&path).unwrap());
        let f = fixture_with(store, BookingRules::default()).await;
        f.engine.upsert_promo(promo("KEEP", Some(3))).await.unwrap();
        let mut req = request(&f.space, t(10, 0), t(12, 0));
        req.promo_code = Some("KEEP".into());
        let b = f.engine.create_booking(req).await.unwrap();
        let b = f.engine.apply_payment_event(b.id, PaymentEvent::Paid).await.unwrap();
        (b, f.space.id)
    };

    let store = Arc::new(Store::open(&path).unwrap());
    let clock = Arc::new(ManualClock::new(at(t(8, 0))));
    let engine = Engine::new(store, clock, TokenSigner::new("test-secret", HOUR_MS));
    assert_eq!(engine.find_booking(booking.id).await.unwrap(), Some(booking.clone()));
    assert_eq!(
        engine.find_booking_by_code(&booking.code).await.unwrap().map(|b| b.id),
        Some(booking.id)
    );
    let kept = engine.store.find_promo("KEEP").await.unwrap().unwrap();
    assert_eq!(kept.used_count, 1);

    // exclusion still enforced after replay
    let space = engine.find_space(space_id).await.unwrap().unwrap();
    assert!(matches!(
        engine.create_booking(request(&space, t(11, 0), t(13, 0))).await,
        Err(EngineError::Conflict { .. })
    ));
}
