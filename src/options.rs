/// Option Store Module
///
/// Global and per-channel bot options. Global options are cached in process
/// for a fixed time-to-live; per-channel ("local") options always go to the
/// store.
///
/// The cache lock is only held for map access. It is never held while a
/// query runs, so it never nests with the connection lock.

use crate::config::CacheSettings;
use crate::core::db::{Condition, Database, SelectQuery, Value};
use crate::core::{DalError, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Largest TTL `chrono::Duration` can hold in seconds
const MAX_TTL_SECS: u64 = i64::MAX as u64 / 1000;

/// A cached global option
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationSetting {
    pub name: String,
    pub value: String,
    pub fetched_at: DateTime<Utc>,
}

impl ConfigurationSetting {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        ConfigurationSetting {
            name: name.into(),
            value: value.into(),
            fetched_at: Utc::now(),
        }
    }

    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.fetched_at < ttl
    }
}

/// Resolves bot options against the store.
///
/// Global writes leave the cache alone unless `write_through` is set, so a
/// read right after a write may return the old value for up to one TTL.
#[derive(Debug)]
pub struct ConfigStore {
    db: Arc<Database>,
    cache: Mutex<HashMap<String, ConfigurationSetting>>,
    ttl: Duration,
    write_through: bool,
}

impl ConfigStore {
    pub fn new(db: Arc<Database>, ttl: Duration, write_through: bool) -> Self {
        ConfigStore {
            db,
            cache: Mutex::new(HashMap::new()),
            ttl,
            write_through,
        }
    }

    pub fn from_settings(db: Arc<Database>, settings: &CacheSettings) -> Self {
        let secs = settings.ttl_secs.min(MAX_TTL_SECS) as i64;
        ConfigStore::new(db, Duration::seconds(secs), settings.write_through)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn cache(&self) -> Result<MutexGuard<'_, HashMap<String, ConfigurationSetting>>> {
        self.cache
            .lock()
            .map_err(|_| DalError::Lock("Failed to acquire option cache lock".to_string()))
    }

    fn cached(&self, name: &str) -> Option<ConfigurationSetting> {
        match self.cache() {
            Ok(cache) => cache.get(name).cloned(),
            Err(e) => {
                error!(error = %e, "Option cache unavailable");
                None
            }
        }
    }

    fn store_cached(&self, setting: ConfigurationSetting) {
        match self.cache() {
            Ok(mut cache) => {
                cache.insert(setting.name.clone(), setting);
            }
            Err(e) => error!(error = %e, "Option cache unavailable"),
        }
    }

    fn evict(&self, name: &str) {
        if let Ok(mut cache) = self.cache() {
            cache.remove(name);
        }
    }

    fn fetch_global(&self, name: &str) -> String {
        let query = SelectQuery::new(["configuration_value"])
            .from("configuration")
            .and_where([Condition::eq("configuration_name", name.to_string())])
            .limit(1, 0);
        self.db.execute_scalar_select(&query)
    }

    /// Value of a global option, or empty when it does not exist.
    ///
    /// Empty results are never cached, so unknown options hit the store on
    /// every read.
    pub fn global(&self, name: &str) -> String {
        let cached = self.cached(name);
        if let Some(setting) = &cached {
            if setting.is_fresh(self.ttl, Utc::now()) {
                return setting.value.clone();
            }
            debug!(option = name, "Cached option expired");
        }

        let value = self.fetch_global(name);
        if value.is_empty() {
            if cached.is_some() {
                self.evict(name);
            }
            warn!(option = name, "Global option not found");
            return value;
        }

        self.store_cached(ConfigurationSetting::new(name, value.clone()));
        value
    }

    /// Writes an existing global option.
    ///
    /// `false` when the store failed or no option has this name; options
    /// are never created here.
    pub fn set_global(&self, name: &str, value: &str) -> bool {
        let updated = match self.db.try_update(
            "configuration",
            &[("configuration_value", Value::Text(value.to_string()))],
            1,
            &[Condition::eq("configuration_name", name.to_string())],
        ) {
            Ok(0) => {
                warn!(option = name, "Unknown option");
                false
            }
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, option = name, "Failed to write global option");
                false
            }
        };
        if updated && self.write_through {
            self.store_cached(ConfigurationSetting::new(name, value));
        }
        updated
    }

    /// Value of an option for one channel: the channel override if there is
    /// one, else the global value. Never cached.
    pub fn local(&self, channel: &str, name: &str) -> Result<String> {
        Ok(self.db.get_local_option(name, channel)?.unwrap_or_default())
    }

    /// Sets (`Some`) or removes (`None`) a channel override.
    ///
    /// Fails when the channel or the option is unknown.
    pub fn set_local(&self, channel: &str, name: &str, value: Option<&str>) -> bool {
        let Some(channel_id) = self.channel_id(channel) else {
            warn!(channel, "Unknown channel");
            return false;
        };
        let Some(option_id) = self.option_id(name) else {
            warn!(option = name, "Unknown option");
            return false;
        };
        let key = [
            Condition::eq("cc_channel", channel_id),
            Condition::eq("cc_config", option_id),
        ];

        let Some(value) = value else {
            return self.db.delete("channelconfig", 1, &key);
        };

        let count = SelectQuery::new(["COUNT(*)"])
            .escape_fields(false)
            .from("channelconfig")
            .and_where(key.clone());
        if self.db.execute_scalar_select(&count) == "1" {
            self.db.update(
                "channelconfig",
                &[("cc_value", Value::Text(value.to_string()))],
                1,
                &key,
            )
        } else {
            self.db.insert(
                "channelconfig",
                &[
                    Value::Integer(channel_id),
                    Value::Integer(option_id),
                    Value::Text(value.to_string()),
                ],
            ) != -1
        }
    }

    /// Empties the global option cache
    pub fn clear_cache(&self) {
        match self.cache() {
            Ok(mut cache) => cache.clear(),
            Err(e) => error!(error = %e, "Option cache unavailable"),
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn channel_id(&self, channel: &str) -> Option<i64> {
        let query = SelectQuery::new(["channel_id"])
            .from("channel")
            .and_where([Condition::eq("channel_name", channel.to_string())]);
        self.db.execute_scalar_select(&query).parse().ok()
    }

    fn option_id(&self, name: &str) -> Option<i64> {
        let query = SelectQuery::new(["configuration_id"])
            .from("configuration")
            .and_where([Condition::eq("configuration_name", name.to_string())]);
        self.db.execute_scalar_select(&query).parse().ok()
    }

    #[cfg(test)]
    pub(crate) fn insert_cached(&self, setting: ConfigurationSetting) {
        self.store_cached(setting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FlakyDriver, TestDatabase};

    fn store(fixture: &TestDatabase) -> ConfigStore {
        ConfigStore::new(fixture.db.clone(), Duration::seconds(300), false)
    }

    fn override_rows(fixture: &TestDatabase) -> String {
        let query = SelectQuery::new(["COUNT(*)"])
            .escape_fields(false)
            .from("channelconfig");
        fixture.db.execute_scalar_select(&query)
    }

    #[test]
    fn test_global_read_populates_cache() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);

        assert_eq!(options.global("baseWiki"), "enwiki");
        assert_eq!(options.cache_len(), 1);

        // served from the cache even though the row changed underneath
        fixture.db.update(
            "configuration",
            &[("configuration_value", Value::Text("dewiki".to_string()))],
            1,
            &[Condition::eq("configuration_name", "baseWiki".to_string())],
        );
        assert_eq!(options.global("baseWiki"), "enwiki");
    }

    #[test]
    fn test_missing_options_are_never_cached() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);

        for _ in 0..3 {
            assert_eq!(options.global("no-such-option"), "");
            assert_eq!(options.cache_len(), 0);
        }
        assert_eq!(options.global("emptyOption"), "");
        assert_eq!(options.cache_len(), 0);
    }

    #[test]
    fn test_stale_entry_is_refreshed() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);
        options.insert_cached(ConfigurationSetting {
            name: "silence".to_string(),
            value: "stale".to_string(),
            fetched_at: Utc::now() - Duration::seconds(301),
        });

        assert_eq!(options.global("silence"), "false");
        let refreshed = options.cached("silence").unwrap();
        assert_eq!(refreshed.value, "false");
        assert!(refreshed.is_fresh(options.ttl(), Utc::now()));
    }

    #[test]
    fn test_stale_entry_of_deleted_option_is_evicted() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);
        options.insert_cached(ConfigurationSetting {
            name: "retired".to_string(),
            value: "old".to_string(),
            fetched_at: Utc::now() - Duration::seconds(600),
        });

        assert_eq!(options.global("retired"), "");
        assert_eq!(options.cache_len(), 0);
    }

    #[test]
    fn test_global_write_does_not_touch_cache() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);

        assert_eq!(options.global("silence"), "false");
        assert!(options.set_global("silence", "true"));
        assert_eq!(options.global("silence"), "false");

        options.clear_cache();
        assert_eq!(options.global("silence"), "true");
    }

    #[test]
    fn test_set_global_rejects_unknown_option() {
        let fixture = TestDatabase::seeded();
        let options = ConfigStore::new(fixture.db.clone(), Duration::seconds(300), true);

        assert!(!options.set_global("no-such-option", "x"));
        assert_eq!(options.cache_len(), 0);
        assert_eq!(options.global("no-such-option"), "");
    }

    #[test]
    fn test_global_write_through() {
        let fixture = TestDatabase::seeded();
        let options = ConfigStore::new(fixture.db.clone(), Duration::seconds(300), true);

        assert_eq!(options.global("silence"), "false");
        assert!(options.set_global("silence", "true"));
        assert_eq!(options.global("silence"), "true");
    }

    #[test]
    fn test_clear_cache_is_idempotent() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);
        options.global("silence");
        options.global("baseWiki");
        assert_eq!(options.cache_len(), 2);

        options.clear_cache();
        assert_eq!(options.cache_len(), 0);
        options.clear_cache();
        assert_eq!(options.cache_len(), 0);
    }

    #[test]
    fn test_local_read_falls_back_to_global() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);

        assert_eq!(options.local("##helpmebot", "silence").unwrap(), "true");
        assert_eq!(options.local("#wikipedia-en-help", "silence").unwrap(), "false");
        assert_eq!(options.local("##helpmebot", "no-such-option").unwrap(), "");
        assert_eq!(options.cache_len(), 0);
    }

    #[test]
    fn test_set_local_inserts_then_updates() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);

        assert!(options.set_local("#wikipedia-en-help", "baseWiki", Some("simplewiki")));
        assert_eq!(options.local("#wikipedia-en-help", "baseWiki").unwrap(), "simplewiki");
        assert_eq!(override_rows(&fixture), "2");

        assert!(options.set_local("#wikipedia-en-help", "baseWiki", Some("dewiki")));
        assert_eq!(options.local("#wikipedia-en-help", "baseWiki").unwrap(), "dewiki");
        assert_eq!(override_rows(&fixture), "2");

        // other channels keep the global value
        assert_eq!(options.local("##helpmebot", "baseWiki").unwrap(), "enwiki");
    }

    #[test]
    fn test_unset_local_removes_override() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);

        assert!(options.set_local("##helpmebot", "silence", None));
        assert_eq!(override_rows(&fixture), "0");
        assert_eq!(options.local("##helpmebot", "silence").unwrap(), "false");
    }

    #[test]
    fn test_set_local_rejects_unknown_names() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);

        assert!(!options.set_local("#nowhere", "silence", Some("true")));
        assert!(!options.set_local("##helpmebot", "no-such-option", Some("true")));
        assert!(!options.set_local("##helpmebot", "no-such-option", None));
        assert_eq!(override_rows(&fixture), "1");
    }

    #[test]
    fn test_channel_id() {
        let fixture = TestDatabase::seeded();
        let options = store(&fixture);
        assert_eq!(options.channel_id("##helpmebot"), Some(1));
        assert_eq!(options.channel_id("#unknown"), None);
    }

    #[test]
    fn test_unreachable_store_soft_fails() {
        let (driver, handle) = FlakyDriver::new();
        let fixture = TestDatabase::with_driver(driver);
        let options = store(&fixture);
        assert_eq!(options.global("silence"), "false");

        handle.refuse_connections(true);
        handle.drop_connections();

        // cached values keep answering without the store
        assert_eq!(options.global("silence"), "false");
        assert_eq!(options.global("baseWiki"), "");
        assert!(!options.set_global("silence", "true"));
        assert!(matches!(
            options.local("##helpmebot", "silence"),
            Err(DalError::ConnectivityExhausted { .. })
        ));
    }

    #[test]
    fn test_from_settings() {
        let fixture = TestDatabase::seeded();
        let options = ConfigStore::from_settings(fixture.db.clone(), &CacheSettings::default());
        assert_eq!(options.ttl(), Duration::seconds(300));
    }
}
