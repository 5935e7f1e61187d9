mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod series;
mod store;
mod waitlist;

pub use conflict::{double_bookings, find_conflicts, validate_span, Conflict};
pub use error::EngineError;
pub use lifecycle::check_transition;
pub use series::{expand_series, occurrence_dates, parse_time_of_day};
pub use store::InMemoryStore;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedCourtState = Arc<RwLock<CourtState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, then do a
/// single flush + fsync for the whole batch and answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Commit what we have before compaction sees the file.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush so a half-buffered batch never leaks into the next one.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The slot reservation engine for one tenant.
pub struct Engine {
    pub(super) store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Held shared by every mutation, exclusively by compaction, so a
    /// snapshot never misses an event appended while it is being written.
    pub(super) gate: Arc<RwLock<()>>,
    pub notify: Arc<NotifyHub>,
    pub config: EngineConfig,
}

/// Write access to one court for the duration of a mutation.
pub(super) struct CourtWriteGuard {
    guard: OwnedRwLockWriteGuard<CourtState>,
    _gate: OwnedRwLockReadGuard<()>,
}

impl Deref for CourtWriteGuard {
    type Target = CourtState;

    fn deref(&self) -> &CourtState {
        &self.guard
    }
}

impl DerefMut for CourtWriteGuard {
    fn deref_mut(&mut self) -> &mut CourtState {
        &mut self.guard
    }
}

/// Apply an event to a court. The caller holds the court write lock.
fn apply_to_court(cs: &mut CourtState, event: &Event, store: &InMemoryStore) {
    let court_id = cs.court.id;
    match event {
        Event::BlockAdded { block } => {
            cs.insert_block(block.clone());
            store.map_entity(block.id, court_id);
        }
        Event::BlockRemoved { id, .. } => {
            cs.remove_block(*id);
            store.unmap_entity(id);
        }
        Event::BookingCreated { booking } => {
            cs.insert_booking(booking.clone());
            store.map_entity(booking.id, court_id);
        }
        Event::BookingStatusChanged { id, status, at, .. } => {
            if let Some(b) = cs.booking_mut(id) {
                b.status = *status;
                b.updated_at = *at;
            }
        }
        Event::BookingRescheduled { id, span, at, .. } => {
            if let Some(mut b) = cs.remove_booking(*id) {
                b.span = *span;
                b.updated_at = *at;
                cs.insert_booking(b);
            }
        }
        Event::BookingPaymentChanged {
            id,
            payment_status,
            at,
            ..
        } => {
            if let Some(b) = cs.booking_mut(id) {
                b.payment_status = *payment_status;
                b.updated_at = *at;
            }
        }
        Event::BookingDeleted { id, .. } => {
            cs.remove_booking(*id);
            store.unmap_entity(id);
        }
        Event::SeriesCreated { series, bookings } => {
            for b in bookings {
                cs.insert_booking(b.clone());
                store.map_entity(b.id, court_id);
            }
            store.map_entity(series.id, court_id);
            cs.series.insert(series.id, series.clone());
        }
        Event::SeriesStatusChanged {
            booking_ids,
            status,
            at,
            ..
        } => {
            for id in booking_ids {
                if let Some(b) = cs.booking_mut(id) {
                    b.status = *status;
                    b.updated_at = *at;
                }
            }
        }
        Event::SeriesPaymentChanged {
            id,
            payment_status,
            at,
            ..
        } => {
            let member_ids = match cs.series.get_mut(id) {
                Some(series) => {
                    series.payment_status = *payment_status;
                    series.booking_ids.clone()
                }
                None => return,
            };
            for member in member_ids {
                if let Some(b) = cs.booking_mut(&member) {
                    b.payment_status = *payment_status;
                    b.updated_at = *at;
                }
            }
        }
        Event::WaitlistJoined { entry } => {
            for token in entry.reservation_token.iter().chain(entry.spent_token.iter()) {
                store.map_token(token.clone(), entry.id);
            }
            store.map_entity(entry.id, court_id);
            cs.waitlist.push(entry.clone());
        }
        Event::WaitlistNotified {
            id,
            token,
            expires_at,
            notified_at,
            ..
        } => {
            if let Some(e) = cs.entry_mut(id) {
                e.status = WaitlistStatus::Notified;
                e.reservation_token = Some(token.clone());
                e.reservation_expires_at = Some(*expires_at);
                e.notified_at = Some(*notified_at);
                store.map_token(token.clone(), *id);
            }
        }
        Event::WaitlistBooked { id, booking, .. } => {
            cs.insert_booking(booking.clone());
            store.map_entity(booking.id, court_id);
            if let Some(e) = cs.entry_mut(id) {
                e.status = WaitlistStatus::Booked;
                e.booking_id = Some(booking.id);
                e.spent_token = e.reservation_token.take();
            }
        }
        Event::WaitlistExpired { id, reason, .. } => {
            if let Some(e) = cs.entry_mut(id) {
                e.status = WaitlistStatus::Expired;
                e.expiry_reason = Some(*reason);
                if e.reservation_token.is_some() {
                    e.spent_token = e.reservation_token.take();
                }
            }
        }
        // Court creation/deletion is handled at the map level, not here
        Event::CourtCreated { .. } | Event::CourtDeleted { .. } => {}
    }
}

/// Drop every index entry pointing into a deleted court.
fn forget_court(cs: &CourtState, store: &InMemoryStore) {
    for b in &cs.bookings {
        store.unmap_entity(&b.id);
    }
    for b in &cs.blocks {
        store.unmap_entity(&b.id);
    }
    for id in cs.series.keys() {
        store.unmap_entity(id);
    }
    for e in &cs.waitlist {
        store.unmap_entity(&e.id);
        for token in e.reservation_token.iter().chain(e.spent_token.iter()) {
            store.unmap_token(token);
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: InMemoryStore::new(),
            wal_tx,
            gate: Arc::new(RwLock::new(())),
            notify,
            config,
        };

        // Replay: we're the sole owner of these Arcs, so try_write always
        // succeeds. Never block here, this may run inside an async context.
        for event in &events {
            match event {
                Event::CourtCreated { court } => {
                    let cs = CourtState::new(court.clone());
                    engine.store.insert_court(court.id, Arc::new(RwLock::new(cs)));
                }
                Event::CourtDeleted { id } => {
                    if let Some((_, cs)) = engine.store.remove_court(id) {
                        let guard = cs.try_read().expect("replay: uncontended read");
                        forget_court(&guard, &engine.store);
                    }
                }
                other => {
                    if let Some(cs) = engine.store.get_court(&other.court_id()) {
                        let mut guard = cs.try_write().expect("replay: uncontended write");
                        apply_to_court(&mut guard, other, &engine.store);
                    }
                }
            }
        }

        tracing::info!(
            "engine loaded {} courts from {} WAL events",
            engine.store.court_count(),
            events.len()
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_court(&self, id: &Ulid) -> Option<SharedCourtState> {
        self.store.get_court(id)
    }

    pub fn court_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.store.court_for_entity(entity_id)
    }

    /// WAL-append then apply. The state only changes once the event is durable.
    pub(super) async fn persist_and_apply(
        &self,
        cs: &mut CourtState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_court(cs, event, &self.store);
        Ok(())
    }

    /// Gate first, then the court: the only lock order mutations use.
    pub(super) async fn court_write(&self, court_id: Ulid) -> Result<CourtWriteGuard, EngineError> {
        let gate = self.gate.clone().read_owned().await;
        let cs = self
            .store
            .get_court(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.clone().write_owned().await;
        // The court may have been deleted (or recreated) while we waited
        let current = self.store.get_court(&court_id);
        if !current.is_some_and(|c| Arc::ptr_eq(&c, &cs)) {
            return Err(EngineError::NotFound(court_id));
        }
        Ok(CourtWriteGuard {
            guard,
            _gate: gate,
        })
    }

    /// Lookup entity → court, acquire the court's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Result<CourtWriteGuard, EngineError> {
        let court_id = self
            .store
            .court_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        self.court_write(court_id).await
    }
}
