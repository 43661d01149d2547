use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::{check_capacity, is_same_booking, validate_request, AdmissionStage, BookingRequest};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn create_room(
        &self,
        id: Ulid,
        name: Option<String>,
        total_units: u32,
        price_per_night: i64,
        discount: u8,
    ) -> Result<(), EngineError> {
        if self.rooms.len() >= MAX_ROOMS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN {
                return Err(EngineError::LimitExceeded("room name too long"));
            }
        if total_units == 0 {
            return Err(EngineError::InvalidQuantity { requested: 0, total_units: None });
        }
        if total_units > MAX_UNITS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many units"));
        }
        if price_per_night < 0 || discount > 100 {
            return Err(EngineError::InvalidGuests("room price must be non-negative and discount a percentage"));
        }

        let _gate = self.commit_gate.read().await;
        let rs = RoomState::new(id, name.clone(), total_units, price_per_night, discount);
        let handle = Arc::new(RwLock::new(rs));
        // Hold the room's write lock through the append so nobody books it before it is durable.
        let guard = handle.clone().write_owned().await;
        match self.rooms.entry(id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }

        let event = Event::RoomCreated { id, name, total_units, price_per_night, discount };
        if let Err(e) = self.wal_append(&event).await {
            drop(guard);
            self.rooms.remove(&id);
            return Err(e);
        }
        info!("room {id} created with {total_units} units");
        Ok(())
    }

    /// Admit a booking or reject it. On success the reservation is durable and
    /// visible; on any error nothing was written.
    pub async fn admit_booking(&self, req: BookingRequest) -> Result<Reservation, EngineError> {
        let room_id = req.room_id;
        let result = self.run_admission(req).await;
        let outcome = match &result {
            Ok(_) => "confirmed",
            Err(e) => e.label(),
        };
        metrics::counter!(crate::observability::ADMISSIONS_TOTAL, "result" => outcome).increment(1);
        match &result {
            Ok(r) => info!(
                "reservation {} confirmed: room {room_id}, {} unit(s), {} -> {}",
                r.id, r.quantity, r.stay.checkin, r.stay.checkout
            ),
            Err(e) if e.is_retryable() => warn!("admission for room {room_id} failed: {e}"),
            Err(e) => debug!("admission for room {room_id} rejected: {e}"),
        }
        result
    }

    async fn run_admission(&self, req: BookingRequest) -> Result<Reservation, EngineError> {
        debug!(stage = ?AdmissionStage::Validating, room = %req.room_id, quantity = req.quantity, "admission");
        let stay = validate_request(&req)?;
        let rs = self
            .get_room(&req.room_id)
            .ok_or(EngineError::NotFound(req.room_id))?;

        let replay = req.id.is_some_and(|id| self.reservation_to_room.contains_key(&id));
        if !replay {
            // Early rejection on a shared read; the decisive check happens again
            // under the write lock below.
            debug!(stage = ?AdmissionStage::CheckingCapacity, room = %req.room_id, "admission");
            let guard = rs.read().await;
            check_capacity(&guard, &stay, req.quantity)?;
        }

        debug!(stage = ?AdmissionStage::Committing, room = %req.room_id, "admission");
        let _gate = self.commit_gate.read().await;
        let mut guard = rs.write().await;

        let id = req.id.unwrap_or_else(Ulid::new);
        match self.reservation_to_room.entry(id) {
            Entry::Occupied(entry) => {
                let owner = *entry.get();
                drop(entry);
                return match guard.find_reservation(&id) {
                    Some(existing) if owner == guard.id && is_same_booking(existing, &req, &stay) => {
                        debug!("reservation {id} already confirmed, returning original");
                        Ok(existing.clone())
                    }
                    _ => Err(EngineError::AlreadyExists(id)),
                };
            }
            // Claim the id so a concurrent admission on another room can't reuse it.
            Entry::Vacant(slot) => {
                slot.insert(guard.id);
            }
        }

        let outcome = self.commit_reservation(&mut guard, id, req, stay).await;
        if outcome.is_err() {
            self.reservation_to_room.remove(&id);
        }
        outcome
    }

    /// Re-derive capacity against the latest state and persist. Caller holds the room's write lock.
    async fn commit_reservation(
        &self,
        guard: &mut RoomState,
        id: Ulid,
        req: BookingRequest,
        stay: Stay,
    ) -> Result<Reservation, EngineError> {
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_ROOM {
            return Err(EngineError::LimitExceeded("too many reservations on room"));
        }
        check_capacity(guard, &stay, req.quantity)?;

        let reservation = Reservation {
            id,
            room_id: guard.id,
            stay,
            quantity: req.quantity,
            created_by: req.created_by,
            guests: req.guests,
        };
        let event = Event::ReservationConfirmed(reservation.clone());
        self.persist_and_apply(guard, &event).await?;
        Ok(reservation)
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        for handle in self.room_handles() {
            let guard = handle.read().await;
            events.push(Event::RoomCreated {
                id: guard.id,
                name: guard.name.clone(),
                total_units: guard.total_units,
                price_per_night: guard.price_per_night,
                discount: guard.discount,
            });
            events.extend(
                guard
                    .reservations
                    .iter()
                    .cloned()
                    .map(Event::ReservationConfirmed),
            );
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::PersistenceError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::PersistenceError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::PersistenceError(e.to_string()))?;
        info!("WAL compacted to {count} events");
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
