//! Record store for spaces, bookings and promo codes.
//!
//! [`RecordStore`] is the contract the engine consumes; [`Store`] is the
//! shipped implementation: in-memory maps guarded by per-record locks, every
//! mutation written ahead to a CRC-framed log.

mod schedule;
pub mod wal;

pub use schedule::{Slot, SpaceSchedule};

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use wal::{wal_writer_loop, Wal, WalCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    NotFound(Ulid),
    SpaceNotFound(Ulid),
    PromoNotFound(String),
    /// Booking code (or id) already taken.
    DuplicateCode(String),
    /// Exclusion violation against an active booking.
    Overlap { booking_code: String },
    StatusMismatch { current: BookingStatus },
    UsageLimitReached(String),
    PromoInactive(String),
    Io(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound(id) => write!(f, "record not found: {id}"),
            StoreError::SpaceNotFound(id) => write!(f, "space not found: {id}"),
            StoreError::PromoNotFound(code) => write!(f, "promo code not found: {code}"),
            StoreError::DuplicateCode(code) => write!(f, "duplicate booking code: {code}"),
            StoreError::Overlap { booking_code } => {
                write!(f, "window overlaps booking {booking_code}")
            }
            StoreError::StatusMismatch { current } => {
                write!(f, "status guard failed, record is {current}")
            }
            StoreError::UsageLimitReached(code) => write!(f, "usage limit reached for {code}"),
            StoreError::PromoInactive(code) => write!(f, "promo code {code} is not redeemable"),
            StoreError::Io(e) => write!(f, "storage I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Selection over bookings. `None`/empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub space_id: Option<Ulid>,
    pub customer_id: Option<Ulid>,
    pub date: Option<NaiveDate>,
    pub statuses: Vec<BookingStatus>,
    pub starts_before: Option<Ms>,
    /// Only bookings whose span overlaps this one.
    pub overlapping: Option<Span>,
}

impl BookingFilter {
    pub fn active_on(space_id: Ulid, date: NaiveDate) -> Self {
        Self {
            space_id: Some(space_id),
            date: Some(date),
            statuses: BookingStatus::ACTIVE.to_vec(),
            ..Self::default()
        }
    }

    /// Active bookings of a space that come within `pad` of `span`, whatever
    /// date they were booked under.
    pub fn active_around(space_id: Ulid, span: Span, pad: Ms) -> Self {
        Self {
            space_id: Some(space_id),
            statuses: BookingStatus::ACTIVE.to_vec(),
            overlapping: Some(span.expand(pad)),
            ..Self::default()
        }
    }

    pub fn matches(&self, booking: &Booking) -> bool {
        self.space_id.is_none_or(|id| booking.space_id == id)
            && self.customer_id.is_none_or(|id| booking.customer_id == id)
            && self.date.is_none_or(|d| booking.date == d)
            && (self.statuses.is_empty() || self.statuses.contains(&booking.status))
            && self.starts_before.is_none_or(|t| booking.span.start < t)
            && self.overlapping.is_none_or(|s| booking.span.overlaps(&s))
    }
}

/// Fields a guarded update may set. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct BookingPatch {
    pub status: Option<BookingStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub checked_in: Option<(Ms, Ulid)>,
    pub checked_out: Option<(Ms, Ulid)>,
    pub cancellation: Option<Cancellation>,
    pub updated_at: Ms,
}

impl BookingPatch {
    pub fn apply(self, booking: &mut Booking) {
        if let Some(status) = self.status {
            booking.status = status;
        }
        if let Some(payment) = self.payment_status {
            booking.payment_status = payment;
        }
        if let Some((at, staff)) = self.checked_in {
            booking.checked_in_at = Some(at);
            booking.checked_in_by = Some(staff);
        }
        if let Some((at, staff)) = self.checked_out {
            booking.checked_out_at = Some(at);
            booking.checked_out_by = Some(staff);
        }
        if let Some(cancellation) = self.cancellation {
            booking.cancellation = Some(cancellation);
        }
        booking.updated_at = self.updated_at;
    }
}

/// Post-transition counters kept on the space record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceActivity {
    CheckedIn,
    CheckedOut,
    NoShow,
    Cancelled,
}

impl SpaceActivity {
    fn apply(self, stats: &mut SpaceStats) {
        match self {
            SpaceActivity::CheckedIn => stats.active_check_ins += 1,
            SpaceActivity::CheckedOut => {
                stats.active_check_ins = stats.active_check_ins.saturating_sub(1);
                stats.completed += 1;
            }
            SpaceActivity::NoShow => stats.no_shows += 1,
            SpaceActivity::Cancelled => stats.cancellations += 1,
        }
    }
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn find_space(&self, id: Ulid) -> Result<Option<Space>, StoreError>;
    async fn upsert_space(&self, space: Space) -> Result<(), StoreError>;
    async fn record_space_activity(
        &self,
        space_id: Ulid,
        activity: SpaceActivity,
    ) -> Result<SpaceStats, StoreError>;

    async fn find_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError>;
    async fn find_booking_by_code(&self, code: &str) -> Result<Option<Booking>, StoreError>;
    async fn find_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, StoreError>;
    /// Insert under two constraints checked atomically with the write: the
    /// booking code is unique, and no active booking of the same space
    /// overlaps `[start - buffer, end + buffer)`.
    async fn insert_booking(&self, booking: Booking, buffer: Ms) -> Result<(), StoreError>;
    /// Compare-and-set: applies `patch` only if the current status is in `expected`.
    async fn update_booking(
        &self,
        id: Ulid,
        expected: &[BookingStatus],
        patch: BookingPatch,
    ) -> Result<Booking, StoreError>;

    async fn find_promo(&self, code: &str) -> Result<Option<PromoCode>, StoreError>;
    async fn upsert_promo(&self, promo: PromoCode) -> Result<(), StoreError>;
    /// Compare-and-increment of `used_count`: re-checks the active flag, the
    /// validity window and the usage limit under the record lock.
    async fn increment_promo_usage(&self, code: &str, now: Ms) -> Result<PromoCode, StoreError>;
    /// Undo one increment. Only for a redemption whose booking was never written.
    async fn release_promo_usage(&self, code: &str) -> Result<PromoCode, StoreError>;
}

pub type SharedSchedule = Arc<RwLock<SpaceSchedule>>;
pub type SharedPromo = Arc<RwLock<PromoCode>>;

pub struct Store {
    spaces: DashMap<Ulid, SharedSchedule>,
    bookings: DashMap<Ulid, Booking>,
    codes: DashMap<String, Ulid>,
    promos: DashMap<String, SharedPromo>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Mutations hold this shared; compaction holds it exclusively so the
    /// snapshot and the log swap see no concurrent appends.
    gate: RwLock<()>,
}

impl Store {
    /// Volatile store: nothing is written to disk.
    pub fn in_memory() -> Self {
        Self {
            spaces: DashMap::new(),
            bookings: DashMap::new(),
            codes: DashMap::new(),
            promos: DashMap::new(),
            wal_tx: None,
            gate: RwLock::new(()),
        }
    }

    /// Replay the log at `path` and start the group-commit writer.
    /// Must be called inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut store = Self::in_memory();
        store.wal_tx = Some(wal_tx);
        let count = events.len();
        for event in events {
            store.replay_event(event);
        }
        tracing::info!("store replayed {count} events from {}", path.display());
        Ok(store)
    }

    // No lock is contended during replay, so try_write always succeeds.
    fn replay_event(&self, event: Event) {
        match event {
            Event::SpaceUpserted(space) => self.install_space(space),
            Event::SpaceStatsUpdated { space_id, stats } => {
                if let Some(sched) = self.schedule(&space_id)
                    && let Ok(mut guard) = sched.try_write()
                {
                    guard.space.stats = stats;
                }
            }
            Event::PromoUpserted(promo) => {
                self.promos
                    .insert(promo.code.clone(), Arc::new(RwLock::new(promo)));
            }
            Event::PromoUsageChanged { code, used_count } => {
                if let Some(promo) = self.promos.get(&code)
                    && let Ok(mut guard) = promo.try_write()
                {
                    guard.used_count = used_count;
                }
            }
            Event::BookingInserted(booking) | Event::BookingUpdated(booking) => {
                match self.schedule(&booking.space_id) {
                    Some(sched) => {
                        if let Ok(mut guard) = sched.try_write() {
                            self.apply_booking(&mut guard, booking);
                        }
                    }
                    None => tracing::warn!(
                        "replay: booking {} references unknown space {}",
                        booking.code,
                        booking.space_id
                    ),
                }
            }
        }
    }

    fn install_space(&self, space: Space) {
        match self.spaces.entry(space.id) {
            Entry::Occupied(existing) => {
                if let Ok(mut guard) = existing.get().try_write() {
                    guard.space = space;
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(SpaceSchedule::new(space))));
            }
        }
    }

    fn schedule(&self, space_id: &Ulid) -> Option<SharedSchedule> {
        self.spaces.get(space_id).map(|e| e.value().clone())
    }

    fn promo(&self, code: &str) -> Option<SharedPromo> {
        self.promos.get(code).map(|e| e.value().clone())
    }

    /// Caller holds the schedule's write lock.
    fn apply_booking(&self, schedule: &mut SpaceSchedule, booking: Booking) {
        schedule.upsert_slot(Slot::of(&booking));
        self.codes.insert(booking.code.clone(), booking.id);
        self.bookings.insert(booking.id, booking);
    }

    /// Write event to WAL via the background group-commit writer.
    async fn persist(&self, event: &Event) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let Some(wal_tx) = &self.wal_tx else {
            return 0;
        };
        let (tx, rx) = oneshot::channel();
        if wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Rewrite the log with only the events needed to recreate current state.
    pub async fn compact(&self) -> Result<(), StoreError> {
        let Some(wal_tx) = &self.wal_tx else {
            return Ok(());
        };
        let _exclusive = self.gate.write().await;

        let mut events = Vec::new();
        let schedules: Vec<SharedSchedule> = self.spaces.iter().map(|e| e.value().clone()).collect();
        for sched in &schedules {
            let guard = sched.read().await;
            events.push(Event::SpaceUpserted(guard.space.clone()));
            for slot in guard.slots() {
                if let Some(booking) = self.bookings.get(&slot.booking_id) {
                    events.push(Event::BookingInserted(booking.value().clone()));
                }
            }
        }
        let promos: Vec<SharedPromo> = self.promos.iter().map(|e| e.value().clone()).collect();
        for promo in &promos {
            events.push(Event::PromoUpserted(promo.read().await.clone()));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Io("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Io("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tracing::info!("compacted WAL to {count} events");
        Ok(())
    }
}

#[async_trait]
impl RecordStore for Store {
    async fn find_space(&self, id: Ulid) -> Result<Option<Space>, StoreError> {
        match self.schedule(&id) {
            Some(sched) => Ok(Some(sched.read().await.space.clone())),
            None => Ok(None),
        }
    }

    async fn upsert_space(&self, space: Space) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        match self.schedule(&space.id) {
            Some(sched) => {
                let mut guard = sched.write().await;
                // Stats belong to the store; owner edits never reset them.
                let space = Space {
                    stats: guard.space.stats.clone(),
                    ..space
                };
                self.persist(&Event::SpaceUpserted(space.clone())).await?;
                guard.space = space;
            }
            None => {
                self.persist(&Event::SpaceUpserted(space.clone())).await?;
                self.install_space(space);
            }
        }
        Ok(())
    }

    async fn record_space_activity(
        &self,
        space_id: Ulid,
        activity: SpaceActivity,
    ) -> Result<SpaceStats, StoreError> {
        let _shared = self.gate.read().await;
        let sched = self
            .schedule(&space_id)
            .ok_or(StoreError::SpaceNotFound(space_id))?;
        let mut guard = sched.write().await;
        let mut stats = guard.space.stats.clone();
        activity.apply(&mut stats);
        self.persist(&Event::SpaceStatsUpdated {
            space_id,
            stats: stats.clone(),
        })
        .await?;
        guard.space.stats = stats.clone();
        Ok(stats)
    }

    async fn find_booking(&self, id: Ulid) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.get(&id).map(|b| b.value().clone()))
    }

    async fn find_booking_by_code(&self, code: &str) -> Result<Option<Booking>, StoreError> {
        let Some(id) = self.codes.get(code).map(|e| *e.value()) else {
            return Ok(None);
        };
        self.find_booking(id).await
    }

    async fn find_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, StoreError> {
        let mut found: Vec<Booking> = match filter.space_id {
            Some(space_id) => {
                let Some(sched) = self.schedule(&space_id) else {
                    return Ok(Vec::new());
                };
                let guard = sched.read().await;
                guard
                    .slots()
                    .iter()
                    .filter_map(|slot| self.bookings.get(&slot.booking_id))
                    .map(|b| b.value().clone())
                    .filter(|b| filter.matches(b))
                    .collect()
            }
            None => self
                .bookings
                .iter()
                .filter(|b| filter.matches(b.value()))
                .map(|b| b.value().clone())
                .collect(),
        };
        found.sort_by_key(|b| (b.span.start, b.id));
        Ok(found)
    }

    async fn insert_booking(&self, booking: Booking, buffer: Ms) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let sched = self
            .schedule(&booking.space_id)
            .ok_or(StoreError::SpaceNotFound(booking.space_id))?;
        let mut guard = sched.write().await;

        if let Some(slot) = guard.find_overlap(&booking.span, buffer) {
            return Err(StoreError::Overlap {
                booking_code: slot.code.clone(),
            });
        }
        if self.bookings.contains_key(&booking.id) {
            return Err(StoreError::DuplicateCode(booking.id.to_string()));
        }
        // Reserve the code first; codes are global, schedules are per space.
        match self.codes.entry(booking.code.clone()) {
            Entry::Occupied(_) => return Err(StoreError::DuplicateCode(booking.code.clone())),
            Entry::Vacant(slot) => {
                slot.insert(booking.id);
            }
        }

        let event = Event::BookingInserted(booking.clone());
        if let Err(e) = self.persist(&event).await {
            self.codes.remove(&booking.code);
            return Err(e);
        }
        self.apply_booking(&mut guard, booking);
        Ok(())
    }

    async fn update_booking(
        &self,
        id: Ulid,
        expected: &[BookingStatus],
        patch: BookingPatch,
    ) -> Result<Booking, StoreError> {
        let _shared = self.gate.read().await;
        let space_id = self
            .bookings
            .get(&id)
            .map(|b| b.space_id)
            .ok_or(StoreError::NotFound(id))?;
        let sched = self
            .schedule(&space_id)
            .ok_or(StoreError::SpaceNotFound(space_id))?;
        let mut guard = sched.write().await;

        // Re-read under the lock: every writer of this booking holds it.
        let mut booking = self
            .bookings
            .get(&id)
            .map(|b| b.value().clone())
            .ok_or(StoreError::NotFound(id))?;
        if !expected.contains(&booking.status) {
            return Err(StoreError::StatusMismatch {
                current: booking.status,
            });
        }
        patch.apply(&mut booking);

        self.persist(&Event::BookingUpdated(booking.clone())).await?;
        self.apply_booking(&mut guard, booking.clone());
        Ok(booking)
    }

    async fn find_promo(&self, code: &str) -> Result<Option<PromoCode>, StoreError> {
        match self.promo(code) {
            Some(promo) => Ok(Some(promo.read().await.clone())),
            None => Ok(None),
        }
    }

    async fn upsert_promo(&self, promo: PromoCode) -> Result<(), StoreError> {
        let _shared = self.gate.read().await;
        let mut promo = promo;
        promo.code = PromoCode::normalize(&promo.code);
        match self.promo(&promo.code) {
            Some(existing) => {
                let mut guard = existing.write().await;
                // Usage belongs to the store; admin edits never rewind it.
                promo.used_count = guard.used_count;
                if promo.usage_limit.is_some_and(|limit| limit < promo.used_count) {
                    return Err(StoreError::UsageLimitReached(promo.code));
                }
                self.persist(&Event::PromoUpserted(promo.clone())).await?;
                *guard = promo;
            }
            None => {
                self.persist(&Event::PromoUpserted(promo.clone())).await?;
                self.promos
                    .insert(promo.code.clone(), Arc::new(RwLock::new(promo)));
            }
        }
        Ok(())
    }

    async fn increment_promo_usage(&self, code: &str, now: Ms) -> Result<PromoCode, StoreError> {
        let _shared = self.gate.read().await;
        let promo = self
            .promo(code)
            .ok_or_else(|| StoreError::PromoNotFound(code.to_string()))?;
        let mut guard = promo.write().await;
        if !guard.is_active || !guard.is_valid_at(now) {
            return Err(StoreError::PromoInactive(code.to_string()));
        }
        if !guard.has_uses_left() {
            return Err(StoreError::UsageLimitReached(code.to_string()));
        }
        let used_count = guard.used_count + 1;
        self.persist(&Event::PromoUsageChanged {
            code: guard.code.clone(),
            used_count,
        })
        .await?;
        guard.used_count = used_count;
        Ok(guard.clone())
    }

    async fn release_promo_usage(&self, code: &str) -> Result<PromoCode, StoreError> {
        let _shared = self.gate.read().await;
        let promo = self
            .promo(code)
            .ok_or_else(|| StoreError::PromoNotFound(code.to_string()))?;
        let mut guard = promo.write().await;
        let used_count = guard.used_count.saturating_sub(1);
        self.persist(&Event::PromoUsageChanged {
            code: guard.code.clone(),
            used_count,
        })
        .await?;
        guard.used_count = used_count;
        Ok(guard.clone())
    }
}
