use std::collections::BTreeMap;

use super::*;
use crate::limits::*;

fn d(s: &str) -> Night {
    s.parse().unwrap()
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("innkeep_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

async fn engine_with_room(wal: &str, total_units: u32) -> (Engine, Ulid) {
    let engine = Engine::new(test_wal_path(wal)).unwrap();
    let room = Ulid::new();
    engine
        .create_room(room, Some("Deluxe".into()), total_units, 12_000, 0)
        .await
        .unwrap();
    (engine, room)
}

fn request(room_id: Ulid, checkin: &str, checkout: &str, quantity: u32) -> BookingRequest {
    BookingRequest {
        id: None,
        room_id,
        checkin: d(checkin),
        checkout: d(checkout),
        quantity,
        created_by: "guest-1".into(),
        guests: GuestDetails::default(),
    }
}

/// Committed units per night across every confirmed reservation of a room.
async fn per_night_load(engine: &Engine, room: Ulid) -> BTreeMap<Night, u32> {
    let mut load = BTreeMap::new();
    for r in engine.reservations_for_room(room).await.unwrap() {
        for night in r.stay.nights() {
            *load.entry(night).or_default() += r.quantity;
        }
    }
    load
}

// ── Admission scenarios ──────────────────────────────────

#[tokio::test]
async fn three_unit_room_booking_sequence() {
    let (engine, room) = engine_with_room("sequence.wal", 3).await;

    let first = engine
        .admit_booking(request(room, "2024-06-01", "2024-06-03", 2))
        .await
        .unwrap();
    assert_eq!(first.quantity, 2);
    assert_eq!(first.room_id, room);
    let snap = engine
        .compute_availability(room, d("2024-06-01"), d("2024-06-03"))
        .await
        .unwrap();
    assert_eq!(snap.available_quantity, 1);
    assert_eq!(snap.total_quantity, 3);

    // Overlaps the first booking by one night: 2 + 2 > 3
    let second = engine
        .admit_booking(request(room, "2024-06-02", "2024-06-04", 2))
        .await;
    assert_eq!(
        second,
        Err(EngineError::InsufficientCapacity { requested: 2, available: 1 })
    );

    // Checks in on the first booking's checkout day
    let third = engine
        .admit_booking(request(room, "2024-06-03", "2024-06-05", 2))
        .await;
    assert!(third.is_ok());

    assert_eq!(engine.reservations_for_room(room).await.unwrap().len(), 2);
}

#[tokio::test]
async fn empty_range_rejected_before_room_lookup() {
    let engine = Engine::new(test_wal_path("empty_range.wal")).unwrap();
    // The room doesn't exist: InvalidRange proves no lookup happened.
    let result = engine
        .admit_booking(request(Ulid::new(), "2024-06-01", "2024-06-01", 1))
        .await;
    assert_eq!(result, Err(EngineError::InvalidRange));
}

#[tokio::test]
async fn unknown_room_not_found() {
    let engine = Engine::new(test_wal_path("unknown_room.wal")).unwrap();
    let room = Ulid::new();
    let result = engine
        .admit_booking(request(room, "2024-06-01", "2024-06-02", 1))
        .await;
    assert_eq!(result, Err(EngineError::NotFound(room)));

    let avail = engine
        .compute_availability(room, d("2024-06-01"), d("2024-06-02"))
        .await;
    assert_eq!(avail, Err(EngineError::NotFound(room)));
}

#[tokio::test]
async fn quantity_above_inventory_is_invalid() {
    let (engine, room) = engine_with_room("qty_above.wal", 2).await;
    let result = engine
        .admit_booking(request(room, "2024-06-01", "2024-06-02", 3))
        .await;
    assert!(matches!(
        result,
        Err(EngineError::InvalidQuantity { requested: 3, total_units: Some(2) })
    ));
    assert!(engine.reservations_for_room(room).await.unwrap().is_empty());
}

#[tokio::test]
async fn anonymous_request_unauthorized() {
    let (engine, room) = engine_with_room("anonymous.wal", 2).await;
    let mut req = request(room, "2024-06-01", "2024-06-02", 1);
    req.created_by = String::new();
    assert_eq!(engine.admit_booking(req).await, Err(EngineError::Unauthorized));
}

#[tokio::test]
async fn full_room_rejects_with_zero_available() {
    let (engine, room) = engine_with_room("full_room.wal", 1).await;
    engine
        .admit_booking(request(room, "2024-08-01", "2024-08-05", 1))
        .await
        .unwrap();
    let result = engine
        .admit_booking(request(room, "2024-08-04", "2024-08-06", 1))
        .await;
    assert_eq!(
        result,
        Err(EngineError::InsufficientCapacity { requested: 1, available: 0 })
    );
}

// ── Concurrency ──────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_last_unit_exactly_one_wins() {
    let (engine, room) = engine_with_room("race_last_unit.wal", 1).await;
    let engine = Arc::new(engine);

    let a = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .admit_booking(request(room, "2024-09-01", "2024-09-04", 1))
                .await
        })
    };
    let b = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .admit_booking(request(room, "2024-09-03", "2024-09-06", 1))
                .await
        })
    };
    let results = [a.await.unwrap(), b.await.unwrap()];

    let confirmed = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(confirmed, 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(EngineError::InsufficientCapacity { requested: 1, available: 0 })
    )));
    assert_eq!(engine.reservations_for_room(room).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_storm_never_overbooks_a_night() {
    let (engine, room) = engine_with_room("storm.wal", 3).await;
    let engine = Arc::new(engine);
    let base = d("2024-10-01");

    let mut handles = Vec::new();
    for i in 0u64..60 {
        let engine = engine.clone();
        let checkin = base.checked_add_days(chrono::Days::new(i % 9)).unwrap();
        let checkout = checkin.checked_add_days(chrono::Days::new(1 + i % 3)).unwrap();
        let quantity = 1 + (i % 2) as u32;
        handles.push(tokio::spawn(async move {
            let mut req = request(room, "2024-10-01", "2024-10-02", quantity);
            req.checkin = checkin;
            req.checkout = checkout;
            req.created_by = format!("guest-{i}");
            engine.admit_booking(req).await
        }));
    }

    let mut confirmed = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => confirmed += 1,
            Err(EngineError::InsufficientCapacity { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(confirmed > 0);

    let load = per_night_load(&engine, room).await;
    for (night, units) in &load {
        assert!(*units <= 3, "night {night} holds {units} units");
    }

    // Blocked dates agree with the per-night load.
    let blocked = engine
        .fully_booked_dates(room, Some(base), Some(d("2024-10-15")))
        .await
        .unwrap();
    let saturated: Vec<Night> = load
        .iter()
        .filter(|(_, units)| **units >= 3)
        .map(|(n, _)| *n)
        .collect();
    assert_eq!(blocked, saturated);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_admissions_on_different_rooms_all_succeed() {
    let engine = Arc::new(Engine::new(test_wal_path("different_rooms.wal")).unwrap());
    let mut rooms = Vec::new();
    for _ in 0..8 {
        let room = Ulid::new();
        engine.create_room(room, None, 1, 0, 0).await.unwrap();
        rooms.push(room);
    }

    let handles: Vec<_> = rooms
        .iter()
        .map(|&room| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .admit_booking(request(room, "2024-11-01", "2024-11-03", 1))
                    .await
            })
        })
        .collect();
    for h in handles {
        assert!(h.await.unwrap().is_ok());
    }
}

// ── Availability and blocked dates ───────────────────────

#[tokio::test]
async fn availability_unaffected_by_disjoint_booking() {
    let (engine, room) = engine_with_room("monotonic.wal", 4).await;
    let before_overlap = engine
        .compute_availability(room, d("2024-06-01"), d("2024-06-05"))
        .await
        .unwrap();
    let before_disjoint = engine
        .compute_availability(room, d("2024-06-10"), d("2024-06-12"))
        .await
        .unwrap();

    engine
        .admit_booking(request(room, "2024-06-03", "2024-06-08", 2))
        .await
        .unwrap();

    let after_overlap = engine
        .compute_availability(room, d("2024-06-01"), d("2024-06-05"))
        .await
        .unwrap();
    let after_disjoint = engine
        .compute_availability(room, d("2024-06-10"), d("2024-06-12"))
        .await
        .unwrap();
    assert!(after_overlap.available_quantity < before_overlap.available_quantity);
    assert_eq!(after_disjoint, before_disjoint);
}

#[tokio::test]
async fn availability_rejects_malformed_range() {
    let (engine, room) = engine_with_room("avail_bad_range.wal", 1).await;
    let result = engine
        .compute_availability(room, d("2024-06-05"), d("2024-06-05"))
        .await;
    assert_eq!(result, Err(EngineError::InvalidRange));
}

#[tokio::test]
async fn blocked_dates_single_unit_room() {
    let (engine, room) = engine_with_room("blocked_single.wal", 1).await;
    engine
        .admit_booking(request(room, "2024-07-10", "2024-07-12", 1))
        .await
        .unwrap();
    let blocked = engine
        .fully_booked_dates(room, Some(d("2024-07-01")), Some(d("2024-07-31")))
        .await
        .unwrap();
    assert_eq!(blocked, vec![d("2024-07-10"), d("2024-07-11")]);
}

#[tokio::test]
async fn blocked_dates_default_horizon_starts_today() {
    let (engine, room) = engine_with_room("blocked_default.wal", 1).await;
    let start = super::admission::today();
    let past = start.checked_sub_days(chrono::Days::new(10)).unwrap();
    let future = start.checked_add_days(chrono::Days::new(5)).unwrap();

    let mut old = request(room, "2024-01-01", "2024-01-02", 1);
    old.checkin = past;
    old.checkout = past.checked_add_days(chrono::Days::new(2)).unwrap();
    engine.admit_booking(old).await.unwrap();

    let mut upcoming = request(room, "2024-01-01", "2024-01-02", 1);
    upcoming.checkin = future;
    upcoming.checkout = future.checked_add_days(chrono::Days::new(1)).unwrap();
    engine.admit_booking(upcoming).await.unwrap();

    let blocked = engine.fully_booked_dates(room, None, None).await.unwrap();
    assert_eq!(blocked, vec![future]);
}

#[tokio::test]
async fn blocked_dates_horizon_limits() {
    let (engine, room) = engine_with_room("blocked_limits.wal", 1).await;
    let too_wide = engine
        .fully_booked_dates(room, Some(d("2024-01-01")), Some(d("2027-01-01")))
        .await;
    assert_eq!(too_wide, Err(EngineError::LimitExceeded("horizon too wide")));

    let inverted = engine
        .fully_booked_dates(room, Some(d("2024-02-01")), Some(d("2024-01-01")))
        .await;
    assert_eq!(inverted, Err(EngineError::InvalidRange));
}

#[tokio::test]
async fn rooms_listed_with_availability_for_stay() {
    let engine = Engine::new(test_wal_path("search.wal")).unwrap();
    let small = Ulid::new();
    let large = Ulid::new();
    engine.create_room(small, Some("Single".into()), 1, 8_000, 0).await.unwrap();
    engine.create_room(large, Some("Suite".into()), 4, 30_000, 10).await.unwrap();
    engine
        .admit_booking(request(small, "2024-06-01", "2024-06-04", 1))
        .await
        .unwrap();

    let rooms = engine
        .list_rooms_for_stay(d("2024-06-02"), d("2024-06-03"))
        .await
        .unwrap();
    assert_eq!(rooms.len(), 2);
    for (info, snap) in rooms {
        if info.id == small {
            assert_eq!(snap.available_quantity, 0);
        } else {
            assert_eq!(snap.available_quantity, 4);
            assert_eq!(info.discount, 10);
        }
    }
    assert_eq!(engine.list_rooms().await.len(), 2);
}

#[tokio::test]
async fn reservations_listed_per_guest() {
    let engine = Engine::new(test_wal_path("per_guest.wal")).unwrap();
    let a = Ulid::new();
    let b = Ulid::new();
    engine.create_room(a, None, 2, 0, 0).await.unwrap();
    engine.create_room(b, None, 2, 0, 0).await.unwrap();

    engine.admit_booking(request(a, "2024-06-05", "2024-06-06", 1)).await.unwrap();
    engine.admit_booking(request(b, "2024-06-01", "2024-06-02", 1)).await.unwrap();
    let mut other = request(a, "2024-06-01", "2024-06-02", 1);
    other.created_by = "guest-2".into();
    engine.admit_booking(other).await.unwrap();

    let mine = engine.reservations_by_guest("guest-1").await;
    assert_eq!(mine.len(), 2);
    assert_eq!(mine[0].room_id, b); // ordered by checkin
    assert_eq!(mine[1].room_id, a);
    assert!(engine.reservations_by_guest("nobody").await.is_empty());
}

// ── Idempotency ──────────────────────────────────────────

#[tokio::test]
async fn resubmitted_booking_returns_original() {
    let (engine, room) = engine_with_room("idempotent.wal", 1).await;
    let id = Ulid::new();
    let mut req = request(room, "2024-06-01", "2024-06-03", 1);
    req.id = Some(id);

    let first = engine.admit_booking(req.clone()).await.unwrap();
    // The room is now full; a naive retry would be rejected for capacity.
    let second = engine.admit_booking(req).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.id, id);
    assert_eq!(engine.reservations_for_room(room).await.unwrap().len(), 1);
    assert_eq!(engine.get_reservation(id).await.unwrap(), first);
}

#[tokio::test]
async fn reused_id_with_different_content_rejected() {
    let (engine, room) = engine_with_room("id_reuse.wal", 2).await;
    let id = Ulid::new();
    let mut req = request(room, "2024-06-01", "2024-06-03", 1);
    req.id = Some(id);
    engine.admit_booking(req.clone()).await.unwrap();

    req.checkout = d("2024-06-04");
    assert_eq!(engine.admit_booking(req).await, Err(EngineError::AlreadyExists(id)));
    assert_eq!(engine.reservations_for_room(room).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_double_submit_books_once() {
    let (engine, room) = engine_with_room("double_submit.wal", 5).await;
    let engine = Arc::new(engine);
    let mut req = request(room, "2024-06-01", "2024-06-03", 2);
    req.id = Some(Ulid::new());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            let req = req.clone();
            tokio::spawn(async move { engine.admit_booking(req).await })
        })
        .collect();
    for h in handles {
        assert!(h.await.unwrap().is_ok());
    }
    assert_eq!(engine.reservations_for_room(room).await.unwrap().len(), 1);
}

// ── Persistence ──────────────────────────────────────────

#[tokio::test]
async fn persistence_failure_leaves_nothing_committed() {
    let (mut engine, room) = engine_with_room("persist_fail.wal", 2).await;
    engine.detach_wal();

    let id = Ulid::new();
    let mut req = request(room, "2024-06-01", "2024-06-03", 1);
    req.id = Some(id);
    let result = engine.admit_booking(req).await;
    assert!(matches!(result, Err(EngineError::PersistenceError(_))));
    assert!(result.unwrap_err().is_retryable());

    assert!(engine.reservations_for_room(room).await.unwrap().is_empty());
    assert_eq!(engine.get_room_for_reservation(&id), None);
    let snap = engine
        .compute_availability(room, d("2024-06-01"), d("2024-06-03"))
        .await
        .unwrap();
    assert_eq!(snap.available_quantity, 2);
}

#[tokio::test]
async fn room_creation_failure_leaves_no_room() {
    let mut engine = Engine::new(test_wal_path("room_fail.wal")).unwrap();
    engine.detach_wal();
    let room = Ulid::new();
    let result = engine.create_room(room, None, 1, 0, 0).await;
    assert!(matches!(result, Err(EngineError::PersistenceError(_))));
    assert!(engine.get_room(&room).is_none());
}

#[tokio::test]
async fn wal_replay_restores_rooms_and_reservations() {
    let path = test_wal_path("replay.wal");
    let room = Ulid::new();
    let booked;
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.create_room(room, Some("Premium".into()), 2, 15_000, 5).await.unwrap();
        booked = engine
            .admit_booking(request(room, "2024-06-01", "2024-06-03", 2))
            .await
            .unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let info = engine.get_room_info(room).await.unwrap();
    assert_eq!(info.name.as_deref(), Some("Premium"));
    assert_eq!(info.total_units, 2);
    assert_eq!(engine.get_reservation(booked.id).await.unwrap(), booked);

    // Replayed state still enforces capacity.
    let result = engine
        .admit_booking(request(room, "2024-06-02", "2024-06-03", 1))
        .await;
    assert_eq!(
        result,
        Err(EngineError::InsufficientCapacity { requested: 1, available: 0 })
    );
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compact_engine.wal");
    let room = Ulid::new();
    {
        let engine = Engine::new(path.clone()).unwrap();
        engine.create_room(room, None, 10, 0, 0).await.unwrap();
        for day in 1..=9 {
            let checkin = format!("2024-06-0{day}");
            let mut req = request(room, &checkin, "2024-06-10", 1);
            req.created_by = format!("guest-{day}");
            engine.admit_booking(req).await.unwrap();
        }
        assert_eq!(engine.wal_appends_since_compact().await, 10);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // Appends after compaction land in the new file.
        engine
            .admit_booking(request(room, "2024-06-20", "2024-06-21", 3))
            .await
            .unwrap();
    }

    let engine = Engine::new(path).unwrap();
    let reservations = engine.reservations_for_room(room).await.unwrap();
    assert_eq!(reservations.len(), 10);
    let blocked = engine
        .fully_booked_dates(room, Some(d("2024-06-01")), Some(d("2024-06-30")))
        .await
        .unwrap();
    assert!(blocked.is_empty());
    let snap = engine
        .compute_availability(room, d("2024-06-09"), d("2024-06-10"))
        .await
        .unwrap();
    assert_eq!(snap.committed_quantity, 9);
}

// ── Rooms ────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_room_rejected() {
    let (engine, room) = engine_with_room("dup_room.wal", 1).await;
    let result = engine.create_room(room, None, 2, 0, 0).await;
    assert_eq!(result, Err(EngineError::AlreadyExists(room)));
    assert_eq!(engine.get_room_info(room).await.unwrap().total_units, 1);
}

#[tokio::test]
async fn room_requires_at_least_one_unit() {
    let engine = Engine::new(test_wal_path("zero_units.wal")).unwrap();
    let result = engine.create_room(Ulid::new(), None, 0, 0, 0).await;
    assert!(matches!(result, Err(EngineError::InvalidQuantity { .. })));
    assert_eq!(engine.room_count(), 0);
}

#[tokio::test]
async fn room_name_length_limited() {
    let engine = Engine::new(test_wal_path("long_name.wal")).unwrap();
    let name = "x".repeat(MAX_NAME_LEN + 1);
    let result = engine.create_room(Ulid::new(), Some(name), 1, 0, 0).await;
    assert_eq!(result, Err(EngineError::LimitExceeded("room name too long")));
}
