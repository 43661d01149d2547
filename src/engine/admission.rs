use chrono::{Datelike, Local};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::availability;
use super::EngineError;

/// Where an admission is when it logs or fails.
/// `Validating -> CheckingCapacity -> Committing -> {Confirmed | Rejected}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionStage {
    Validating,
    CheckingCapacity,
    Committing,
}

/// A request to hold `quantity` units of a room for one stay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    /// Caller-chosen id. Resubmitting the same request under the same id
    /// returns the original reservation instead of booking twice.
    pub id: Option<Ulid>,
    pub room_id: Ulid,
    pub checkin: Night,
    pub checkout: Night,
    pub quantity: u32,
    /// Authenticated identity, already verified by the session layer.
    pub created_by: String,
    pub guests: GuestDetails,
}

pub(crate) fn today() -> Night {
    Local::now().date_naive()
}

pub(crate) fn validate_stay(checkin: Night, checkout: Night) -> Result<Stay, EngineError> {
    let stay = Stay::try_new(checkin, checkout).ok_or(EngineError::InvalidRange)?;
    if stay.checkin.year() < MIN_VALID_YEAR || stay.checkout.year() > MAX_VALID_YEAR {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    Ok(stay)
}

/// Static checks only. Touches no room and no reservation.
pub(crate) fn validate_request(req: &BookingRequest) -> Result<Stay, EngineError> {
    let stay = validate_stay(req.checkin, req.checkout)?;
    if stay.night_count() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    if req.quantity == 0 {
        return Err(EngineError::InvalidQuantity { requested: 0, total_units: None });
    }
    if req.created_by.trim().is_empty() {
        return Err(EngineError::Unauthorized);
    }
    if req.created_by.len() > MAX_IDENTITY_LEN {
        return Err(EngineError::LimitExceeded("identity too long"));
    }
    validate_guests(&req.guests)?;
    Ok(stay)
}

fn validate_guests(guests: &GuestDetails) -> Result<(), EngineError> {
    if guests.adults == 0 {
        return Err(EngineError::InvalidGuests("at least one adult required"));
    }
    if guests.adults.saturating_add(guests.children) > MAX_GUESTS_PER_BOOKING {
        return Err(EngineError::InvalidGuests("too many guests"));
    }
    if guests.total_price < 0 {
        return Err(EngineError::InvalidGuests("total price must not be negative"));
    }
    if guests.discount > 100 {
        return Err(EngineError::InvalidGuests("discount must be a percentage"));
    }
    Ok(())
}

/// Admit `quantity` more units for `stay`, or report what is left.
pub(crate) fn check_capacity(
    rs: &RoomState,
    stay: &Stay,
    quantity: u32,
) -> Result<AvailabilitySnapshot, EngineError> {
    if quantity > rs.total_units {
        return Err(EngineError::InvalidQuantity {
            requested: quantity,
            total_units: Some(rs.total_units),
        });
    }
    let snapshot = availability(rs.total_units, rs.overlapping(stay), stay);
    if u64::from(snapshot.committed_quantity) + u64::from(quantity) > u64::from(rs.total_units) {
        return Err(EngineError::InsufficientCapacity {
            requested: quantity,
            available: snapshot.available_quantity,
        });
    }
    Ok(snapshot)
}

/// Whether `existing` is the reservation `req` would have created.
pub(crate) fn is_same_booking(existing: &Reservation, req: &BookingRequest, stay: &Stay) -> bool {
    existing.room_id == req.room_id
        && existing.stay == *stay
        && existing.quantity == req.quantity
        && existing.created_by == req.created_by
}
