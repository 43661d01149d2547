use chrono::Days;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::admission::{today, validate_stay};
use super::availability::{availability, fully_booked_nights};
use super::{Engine, EngineError};

impl Engine {
    /// Point-in-time availability of a room for `[checkin, checkout)`.
    /// Informational only: admission re-derives it under the room's write lock.
    pub async fn compute_availability(
        &self,
        room_id: Ulid,
        checkin: Night,
        checkout: Night,
    ) -> Result<AvailabilitySnapshot, EngineError> {
        let stay = validate_stay(checkin, checkout)?;
        if stay.night_count() > MAX_HORIZON_NIGHTS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(availability(guard.total_units, guard.overlapping(&stay), &stay))
    }

    /// Saturated nights of a room within `[horizon_start, horizon_end)`, ascending.
    ///
    /// `horizon_start` defaults to today, `horizon_end` to `DEFAULT_HORIZON_NIGHTS`
    /// after the start.
    pub async fn fully_booked_dates(
        &self,
        room_id: Ulid,
        horizon_start: Option<Night>,
        horizon_end: Option<Night>,
    ) -> Result<Vec<Night>, EngineError> {
        let start = horizon_start.unwrap_or_else(today);
        let end = match horizon_end {
            Some(end) => end,
            None => start
                .checked_add_days(Days::new(DEFAULT_HORIZON_NIGHTS))
                .ok_or(EngineError::LimitExceeded("date out of range"))?,
        };
        let horizon = validate_stay(start, end)?;
        if horizon.night_count() > MAX_HORIZON_NIGHTS {
            return Err(EngineError::LimitExceeded("horizon too wide"));
        }
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        let blocked = fully_booked_nights(guard.total_units, guard.overlapping(&horizon), &horizon);
        Ok(blocked.into_iter().collect())
    }

    pub async fn list_rooms(&self) -> Vec<RoomInfo> {
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for handle in self.room_handles() {
            rooms.push(handle.read().await.info());
        }
        rooms.sort_by_key(|r| r.id);
        rooms
    }

    /// Every room with its availability for one stay.
    pub async fn list_rooms_for_stay(
        &self,
        checkin: Night,
        checkout: Night,
    ) -> Result<Vec<(RoomInfo, AvailabilitySnapshot)>, EngineError> {
        let stay = validate_stay(checkin, checkout)?;
        if stay.night_count() > MAX_HORIZON_NIGHTS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let mut rooms = Vec::with_capacity(self.rooms.len());
        for handle in self.room_handles() {
            let guard = handle.read().await;
            let snapshot = availability(guard.total_units, guard.overlapping(&stay), &stay);
            rooms.push((guard.info(), snapshot));
        }
        rooms.sort_by_key(|(info, _)| info.id);
        Ok(rooms)
    }

    #[cfg(test)]
    pub async fn get_room_info(&self, room_id: Ulid) -> Result<RoomInfo, EngineError> {
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let info = rs.read().await.info();
        Ok(info)
    }

    pub async fn reservations_for_room(&self, room_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        Ok(guard.reservations.clone())
    }

    /// Reservations made by one guest across all rooms, ordered by checkin.
    pub async fn reservations_by_guest(&self, created_by: &str) -> Vec<Reservation> {
        let mut found = Vec::new();
        for handle in self.room_handles() {
            let guard = handle.read().await;
            found.extend(
                guard
                    .reservations
                    .iter()
                    .filter(|r| r.created_by == created_by)
                    .cloned(),
            );
        }
        found.sort_by_key(|r| (r.stay.checkin, r.id));
        found
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let room_id = self
            .get_room_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_room(&room_id)
            .ok_or(EngineError::NotFound(room_id))?;
        let guard = rs.read().await;
        guard
            .find_reservation(&id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }
}
