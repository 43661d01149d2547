mod admission;
mod availability;
mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use admission::{AdmissionStage, BookingRequest};
pub use availability::{availability, committed_per_night, fully_booked_nights};
pub use error::EngineError;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Drain every Append already queued behind it (the batch window).
/// 3. Commit the whole batch with one fsync, then answer every sender.
///
/// A non-append command ends the batch window; the batch is flushed first.
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
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let (events, senders): (Vec<Event>, Vec<_>) = batch.into_iter().unzip();
    let flush_start = std::time::Instant::now();
    // All or nothing: a failed batch is cut back out of the log.
    let result = wal.commit(&events);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(ref e) = result {
        tracing::error!("WAL commit failed for batch of {}: {e}", events.len());
    }
    for tx in senders {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// One property's rooms and reservations, rebuilt from its WAL on startup.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → room id.
    pub(super) reservation_to_room: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared for append+apply; compaction holds it exclusively
    /// so the snapshot it writes can't miss an acknowledged append.
    pub(super) commit_gate: RwLock<()>,
}

/// Apply an event directly to a RoomState (caller holds the lock).
fn apply_to_room(rs: &mut RoomState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ReservationConfirmed(reservation) => {
            index.insert(reservation.id, reservation.room_id);
            rs.insert_reservation(reservation.clone());
        }
        // Room creation is handled at the DashMap level, not here
        Event::RoomCreated { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let reservation_to_room = DashMap::new();
        let mut rooms: HashMap<Ulid, RoomState> = HashMap::new();
        for event in &events {
            match event {
                Event::RoomCreated { id, name, total_units, price_per_night, discount } => {
                    rooms.insert(
                        *id,
                        RoomState::new(*id, name.clone(), *total_units, *price_per_night, *discount),
                    );
                }
                Event::ReservationConfirmed(reservation) => {
                    match rooms.get_mut(&reservation.room_id) {
                        Some(rs) => apply_to_room(rs, event, &reservation_to_room),
                        None => tracing::warn!(
                            "replay: reservation {} references unknown room {}",
                            reservation.id,
                            reservation.room_id
                        ),
                    }
                }
            }
        }
        tracing::debug!(
            "replayed {} events into {} rooms from {}",
            events.len(),
            rooms.len(),
            wal_path.display()
        );

        Ok(Self {
            rooms: rooms
                .into_iter()
                .map(|(id, rs)| (id, Arc::new(RwLock::new(rs))))
                .collect(),
            wal_tx,
            reservation_to_room,
            commit_gate: RwLock::new(()),
        })
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
            .map_err(|_| EngineError::PersistenceError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::PersistenceError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::PersistenceError(e.to_string()))
    }

    pub fn get_room(&self, id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(id).map(|e| e.value().clone())
    }

    pub fn get_room_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_to_room.get(reservation_id).map(|e| *e.value())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// WAL-append then apply. Memory only changes once the WAL acknowledged the event.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_room(rs, event, &self.reservation_to_room);
        Ok(())
    }

    /// Snapshot of every room handle, so callers never hold a DashMap shard across an await.
    pub(super) fn room_handles(&self) -> Vec<SharedRoomState> {
        self.rooms.iter().map(|e| e.value().clone()).collect()
    }

    /// Swap the WAL writer for a closed channel so every commit fails.
    #[cfg(test)]
    pub(super) fn detach_wal(&mut self) {
        let (tx, _) = mpsc::channel(1);
        self.wal_tx = tx;
    }
}
