use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::warn;

use crate::errors::{AppError, AppResult};

pub const GEOLOCATION_PERMISSION_KEY: &str = "modi.geolocation.permission";
pub const NOTIFICATIONS_ENABLED_KEY: &str = "modi.notifications.enabled";
pub const LAST_SHOWN_REMINDER_KEY: &str = "modi.reminders.last_shown_id";

const DENIED: &str = "denied";

/// Flat string key/value persistence.
pub trait FlagStore: Send + Sync {
    fn get(&self, key: &str) -> AppResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> AppResult<()>;
    fn remove(&self, key: &str) -> AppResult<()>;
}

pub struct SqliteFlagStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteFlagStore {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

impl FlagStore for SqliteFlagStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.db.lock();
        conn.query_row(
            "SELECT value FROM local_flags WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO local_flags (key, value, updated_at)
            VALUES (?1, ?2, DATETIME('now'))
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = DATETIME('now')",
            (key, value),
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute("DELETE FROM local_flags WHERE key = ?1", [key])?;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryFlagStore {
    values: Mutex<HashMap<String, String>>,
}

impl FlagStore for MemoryFlagStore {
    fn get(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> AppResult<()> {
        self.values.lock().remove(key);
        Ok(())
    }
}

/// Typed view over the flags the pipeline persists. Read failures fall back
/// to defaults; write failures are returned so callers can log them.
#[derive(Clone)]
pub struct LocalFlags {
    store: Arc<dyn FlagStore>,
}

impl LocalFlags {
    pub fn new(store: Arc<dyn FlagStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryFlagStore::default()))
    }

    pub fn geolocation_denied(&self) -> bool {
        self.read(GEOLOCATION_PERMISSION_KEY).as_deref() == Some(DENIED)
    }

    pub fn mark_geolocation_denied(&self) -> AppResult<()> {
        self.store.set(GEOLOCATION_PERMISSION_KEY, DENIED)
    }

    pub fn clear_geolocation_denied(&self) -> AppResult<()> {
        self.store.remove(GEOLOCATION_PERMISSION_KEY)
    }

    pub fn notifications_enabled(&self) -> bool {
        self.read(NOTIFICATIONS_ENABLED_KEY).as_deref() == Some("true")
    }

    pub fn set_notifications_enabled(&self, enabled: bool) -> AppResult<()> {
        self.store.set(
            NOTIFICATIONS_ENABLED_KEY,
            if enabled { "true" } else { "false" },
        )
    }

    pub fn last_shown_reminder_id(&self) -> Option<i64> {
        self.read(LAST_SHOWN_REMINDER_KEY)
            .and_then(|value| value.trim().parse::<i64>().ok())
    }

    pub fn set_last_shown_reminder_id(&self, id: i64) -> AppResult<()> {
        self.store.set(LAST_SHOWN_REMINDER_KEY, &id.to_string())
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.store.get(key) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "local_flags", key, error = ?err, "failed to read flag; using default");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn sqlite_flags() -> LocalFlags {
        let connection = db::in_memory().unwrap();
        LocalFlags::new(Arc::new(SqliteFlagStore::new(Arc::new(Mutex::new(
            connection,
        )))))
    }

    #[test]
    fn defaults_when_flags_absent() {
        let flags = LocalFlags::in_memory();
        assert!(!flags.geolocation_denied());
        assert!(!flags.notifications_enabled());
        assert_eq!(flags.last_shown_reminder_id(), None);
    }

    #[test]
    fn sqlite_store_overwrites_and_removes() {
        let flags = sqlite_flags();
        flags.set_last_shown_reminder_id(3).unwrap();
        flags.set_last_shown_reminder_id(5).unwrap();
        assert_eq!(flags.last_shown_reminder_id(), Some(5));

        flags.mark_geolocation_denied().unwrap();
        assert!(flags.geolocation_denied());
        flags.clear_geolocation_denied().unwrap();
        assert!(!flags.geolocation_denied());

        flags.set_notifications_enabled(true).unwrap();
        assert!(flags.notifications_enabled());
    }

    #[test]
    fn unparseable_watermark_reads_as_absent() {
        let store = Arc::new(MemoryFlagStore::default());
        store.set(LAST_SHOWN_REMINDER_KEY, "five").unwrap();
        let flags = LocalFlags::new(store);
        assert_eq!(flags.last_shown_reminder_id(), None);
    }
}
