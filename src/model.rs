use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Calendar date without time of day. The only time type.
pub type Night = NaiveDate;

/// Half-open stay `[checkin, checkout)`.
///
/// The guest occupies the night of `checkin` through the night before
/// `checkout`; the checkout day itself is free for the next arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stay {
    pub checkin: Night,
    pub checkout: Night,
}

impl Stay {
    pub fn new(checkin: Night, checkout: Night) -> Self {
        debug_assert!(checkin < checkout, "Stay checkin must be before checkout");
        Self { checkin, checkout }
    }

    /// Build a stay, returning `None` unless `checkin < checkout`.
    pub fn try_new(checkin: Night, checkout: Night) -> Option<Self> {
        (checkin < checkout).then_some(Self { checkin, checkout })
    }

    pub fn night_count(&self) -> i64 {
        (self.checkout - self.checkin).num_days()
    }

    /// Strict on both sides: a checkout on D and a checkin on D share no night.
    pub fn overlaps(&self, other: &Stay) -> bool {
        self.checkin < other.checkout && other.checkin < self.checkout
    }

    pub fn contains_night(&self, night: Night) -> bool {
        self.checkin <= night && night < self.checkout
    }

    /// Every occupied night, checkin inclusive, checkout exclusive.
    pub fn nights(&self) -> impl Iterator<Item = Night> + '_ {
        self.checkin
            .iter_days()
            .take_while(move |n| *n < self.checkout)
    }

    /// Intersection with `other`, if the two share at least one night.
    pub fn clamp_to(&self, other: &Stay) -> Option<Stay> {
        Stay::try_new(
            self.checkin.max(other.checkin),
            self.checkout.min(other.checkout),
        )
    }

    /// `[from, from + nights)`, or `None` when the end falls off the calendar.
    pub fn starting_at(from: Night, nights: u64) -> Option<Stay> {
        let end = from.checked_add_days(Days::new(nights))?;
        Stay::try_new(from, end)
    }
}

/// Guest-facing details carried on a reservation. None of these affect capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestDetails {
    pub adults: u32,
    pub children: u32,
    /// Minor currency units, as quoted to the guest.
    pub total_price: i64,
    /// Percent, 0–100.
    pub discount: u8,
}

impl Default for GuestDetails {
    fn default() -> Self {
        Self {
            adults: 1,
            children: 0,
            total_price: 0,
            discount: 0,
        }
    }
}

/// A confirmed booking of `quantity` units of a room for one stay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub room_id: Ulid,
    pub stay: Stay,
    pub quantity: u32,
    pub created_by: String,
    pub guests: GuestDetails,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Physically identical units of this room type (always >= 1).
    pub total_units: u32,
    pub price_per_night: i64,
    pub discount: u8,
    /// Confirmed reservations, sorted by `stay.checkin`.
    pub reservations: Vec<Reservation>,
}

impl RoomState {
    pub fn new(id: Ulid, name: Option<String>, total_units: u32, price_per_night: i64, discount: u8) -> Self {
        Self {
            id,
            name,
            total_units,
            price_per_night,
            discount,
            reservations: Vec::new(),
        }
    }

    /// Insert reservation maintaining sort order by checkin.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.stay.checkin <= reservation.stay.checkin);
        self.reservations.insert(pos, reservation);
    }

    pub fn find_reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Reservations whose stay overlaps the query.
    /// Uses binary search to skip reservations checking in on or after `query.checkout`.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.stay.checkin < query.checkout);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.stay.checkout > query.checkin)
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            id: self.id,
            name: self.name.clone(),
            total_units: self.total_units,
            price_per_night: self.price_per_night,
            discount: self.discount,
        }
    }
}

/// Persisted event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: Ulid,
        name: Option<String>,
        total_units: u32,
        price_per_night: i64,
        discount: u8,
    },
    ReservationConfirmed(Reservation),
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub total_units: u32,
    pub price_per_night: i64,
    pub discount: u8,
}

/// Point-in-time read of a room's inventory for one stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub total_quantity: u32,
    pub committed_quantity: u32,
    pub available_quantity: u32,
}
