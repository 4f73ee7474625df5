//! Database configuration.

/// Name used for both the database and its object store by default.
pub const DEFAULT_NAME: &str = "__dex__";

/// Key path records are keyed by.
pub const KEY_PATH: &str = "key";

/// Configuration for a [`crate::Database`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the database to open.
    pub name: String,

    /// Name of the object store holding the records.
    pub store_name: String,

    /// Name of the unique lookup index over record keys.
    pub index_name: String,

    /// Schema version requested when opening. A newer version than the
    /// stored one triggers the upgrade.
    pub schema_version: u32,

    /// Maximum number of keys `keys()` scans (`None` = unbounded).
    pub max_scan_keys: Option<usize>,

    /// Number of published events kept for replay.
    pub event_history: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.to_string(),
            store_name: DEFAULT_NAME.to_string(),
            index_name: KEY_PATH.to_string(),
            schema_version: 1,
            max_scan_keys: None,
            event_history: 1024,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the database name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the object store name.
    #[must_use]
    pub fn store_name(mut self, name: impl Into<String>) -> Self {
        self.store_name = name.into();
        self
    }

    /// Sets the lookup index name.
    #[must_use]
    pub fn index_name(mut self, name: impl Into<String>) -> Self {
        self.index_name = name.into();
        self
    }

    /// Sets the schema version.
    #[must_use]
    pub const fn schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Bounds the number of keys a key scan visits.
    #[must_use]
    pub const fn max_scan_keys(mut self, limit: usize) -> Self {
        self.max_scan_keys = Some(limit);
        self
    }

    /// Sets the event history size.
    #[must_use]
    pub const fn event_history(mut self, size: usize) -> Self {
        self.event_history = size;
        self
    }
}
