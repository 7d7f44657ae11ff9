/// Composition root: builds the database service and its clients from
/// settings. Consumers receive what they need from here by reference.

use crate::config::{BootstrapConfig, Settings};
use crate::core::db::{Database, Driver, SqliteDriver};
use crate::core::Result;
use crate::messages::MessageStore;
use crate::options::ConfigStore;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct Services {
    pub database: Arc<Database>,
    pub options: Arc<ConfigStore>,
    pub messages: MessageStore,
}

impl Services {
    /// Reads the bootstrap file named in `settings` and connects through
    /// the SQLite driver.
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let bootstrap = BootstrapConfig::load(&settings.database.bootstrap_file)?;
        let driver = SqliteDriver::new(settings.database.data_dir.clone());
        Services::with_driver(settings, Box::new(driver), bootstrap)
    }

    /// Wires the services over any driver
    pub fn with_driver(
        settings: &Settings,
        driver: Box<dyn Driver>,
        bootstrap: BootstrapConfig,
    ) -> Result<Self> {
        let policy = settings.reconnect.policy()?;
        let database = Arc::new(Database::connect(driver, bootstrap, policy)?);
        if settings.database.install_schema {
            database.install_schema()?;
        }

        info!(
            ttl_secs = settings.cache.ttl_secs,
            write_through = settings.cache.write_through,
            "Data-access services ready"
        );
        Ok(Services {
            options: Arc::new(ConfigStore::from_settings(database.clone(), &settings.cache)),
            messages: MessageStore::new(database.clone()),
            database,
        })
    }
}
