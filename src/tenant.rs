use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::compactor;
use crate::engine::Engine;
use crate::limits::*;

/// One engine per property (hotel). A connection picks its property by
/// database name; each property has its own log file and compactor.
pub struct TenantManager {
    engines: DashMap<String, Arc<Engine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    max_properties: usize,
}

/// Filesystem-safe form of a property name.
fn sanitize(property: &str) -> io::Result<String> {
    if property.len() > MAX_PROPERTY_NAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "property name too long"));
    }
    let safe: String = property
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();
    if safe.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty property name"));
    }
    Ok(safe)
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            max_properties: MAX_PROPERTIES,
        }
    }

    pub fn with_max_properties(mut self, max_properties: usize) -> Self {
        self.max_properties = max_properties.min(MAX_PROPERTIES);
        self
    }

    /// The engine for `property`, loading it from disk on first use.
    pub fn get_or_create(&self, property: &str) -> io::Result<Arc<Engine>> {
        let key = sanitize(property)?;
        if let Some(engine) = self.engines.get(&key) {
            return Ok(engine.value().clone());
        }
        if self.property_count() >= self.max_properties {
            return Err(io::Error::other("too many properties"));
        }

        // Replay happens under the entry lock so two first connections can't
        // open the same log twice.
        let engine = match self.engines.entry(key) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{}.wal", slot.key()));
                let engine = Arc::new(Engine::new(wal_path)?);
                tracing::info!(
                    "property {} loaded with {} rooms",
                    slot.key(),
                    engine.room_count()
                );
                slot.insert(engine.clone());
                engine
            }
        };

        tokio::spawn(compactor::run_compactor(engine.clone(), self.compact_threshold));
        metrics::gauge!(crate::observability::PROPERTIES_ACTIVE).set(self.property_count() as f64);
        Ok(engine)
    }

    pub fn property_count(&self) -> usize {
        self.engines.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;

    use crate::engine::BookingRequest;
    use crate::model::GuestDetails;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("innkeep_test_tenant").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn properties_are_isolated() {
        let tm = TenantManager::new(test_data_dir("isolation"), 1000);
        let seaside = tm.get_or_create("seaside").unwrap();
        let alpine = tm.get_or_create("alpine").unwrap();

        let room = Ulid::new();
        seaside.create_room(room, None, 1, 0, 0).await.unwrap();
        alpine.create_room(room, None, 1, 0, 0).await.unwrap();

        let req = BookingRequest {
            id: None,
            room_id: room,
            checkin: "2024-06-01".parse().unwrap(),
            checkout: "2024-06-02".parse().unwrap(),
            quantity: 1,
            created_by: "alice".into(),
            guests: GuestDetails::default(),
        };
        seaside.admit_booking(req.clone()).await.unwrap();

        // The same room id at another property is untouched.
        alpine.admit_booking(req).await.unwrap();
        assert_eq!(seaside.reservations_for_room(room).await.unwrap().len(), 1);
        assert_eq!(alpine.reservations_for_room(room).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn property_loaded_lazily() {
        let dir = test_data_dir("lazy");
        let tm = TenantManager::new(dir.clone(), 1000);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        tm.get_or_create("harbour").unwrap();
        assert!(dir.join("harbour.wal").exists());
        assert_eq!(tm.property_count(), 1);
    }

    #[tokio::test]
    async fn same_engine_returned() {
        let tm = TenantManager::new(test_data_dir("same_engine"), 1000);
        let a = tm.get_or_create("lodge").unwrap();
        let b = tm.get_or_create("lodge").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn property_name_sanitized() {
        let dir = test_data_dir("sanitize");
        let tm = TenantManager::new(dir.clone(), 1000);

        tm.get_or_create("../evil").unwrap();
        assert!(dir.join("evil.wal").exists());
        // Sanitized names share an engine.
        assert!(Arc::ptr_eq(
            &tm.get_or_create("evil").unwrap(),
            &tm.get_or_create("../evil").unwrap()
        ));

        let err = tm.get_or_create("../..").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn property_name_too_long() {
        let tm = TenantManager::new(test_data_dir("too_long"), 1000);
        let err = tm
            .get_or_create(&"x".repeat(MAX_PROPERTY_NAME_LEN + 1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("property name too long"));
        assert!(tm.get_or_create(&"x".repeat(MAX_PROPERTY_NAME_LEN)).is_ok());
    }

    #[tokio::test]
    async fn property_count_limited() {
        let tm = TenantManager::new(test_data_dir("count_limit"), 1000).with_max_properties(8);
        for i in 0..8 {
            tm.get_or_create(&format!("p{i}")).unwrap();
        }
        let err = tm.get_or_create("one_more").err().unwrap();
        assert!(err.to_string().contains("too many properties"));
    }

    #[tokio::test]
    async fn reload_after_restart() {
        let dir = test_data_dir("reload");
        let room = Ulid::new();
        {
            let tm = TenantManager::new(dir.clone(), 1000);
            let engine = tm.get_or_create("inn").unwrap();
            engine.create_room(room, Some("Loft".into()), 2, 0, 0).await.unwrap();
        }
        let tm = TenantManager::new(dir, 1000);
        let engine = tm.get_or_create("inn").unwrap();
        assert_eq!(engine.get_room_info(room).await.unwrap().total_units, 2);
    }
}
