use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;

use crate::engine::{BallotBox, RetryPolicy, TallyReader};
use crate::ledger::{Ledger, MemoryLedger, MongoLedger};
use crate::model::mongodb::ensure_indexes_exist;

/// Which ledger implementation backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// MongoDB replica set, configured by `DbConfig`.
    Mongodb,
    /// Process-local store. Nothing survives a restart.
    Memory,
}

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_storage")]
    storage: StorageBackend,
    #[serde(default = "default_max_cast_attempts")]
    max_cast_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    retry_backoff_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    lock_timeout_ms: u64,
}

fn default_storage() -> StorageBackend {
    StorageBackend::Mongodb
}

fn default_max_cast_attempts() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    20
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

impl Config {
    pub fn storage(&self) -> StorageBackend {
        self.storage
    }

    /// Attempts per ballot when storage keeps failing transiently.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_cast_attempts,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }

    /// How long the embedded store waits for a row lock.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// A fairing that loads the application config and puts it in managed state.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
    // non-secrets
    #[serde(default = "default_db_name")]
    db_name: String,
}

fn default_db_name() -> String {
    "ballots".to_string()
}

/// A fairing that builds the configured ledger and places a `BallotBox` and
/// a `TallyReader` over it into managed state. Must be attached after
/// [`ConfigFairing`].
///
/// For MongoDB this connects and ensures the indexes exist first.
pub struct LedgerFairing;

#[rocket::async_trait]
impl Fairing for LedgerFairing {
    fn info(&self) -> Info {
        Info {
            name: "Ledger",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let Some(config) = rocket.state::<Config>().cloned() else {
            error!("Application config must be loaded before the ledger");
            return Err(rocket);
        };

        let ledger: Arc<dyn Ledger> = match config.storage() {
            StorageBackend::Memory => {
                info!("Using the in-memory ledger");
                Arc::new(MemoryLedger::new(config.lock_timeout()))
            }
            StorageBackend::Mongodb => {
                // Load the config.
                let db_config = match rocket.figment().extract::<DbConfig>() {
                    Ok(config) => config,
                    Err(e) => {
                        error!("Failed to load database config");
                        rocket::config::pretty_print_error(e);
                        return Err(rocket);
                    }
                };
                info!("Loaded database config, connecting...");
                // Construct the connection.
                let client = match MongoClient::with_uri_str(&db_config.db_uri).await {
                    Ok(client) => client,
                    Err(e) => {
                        error!("Failed to connect to database: {e}");
                        return Err(rocket);
                    }
                };
                let db = client.database(&get_database_name(db_config.db_name));

                // Ensure the required indexes exist.
                if let Err(e) = ensure_indexes_exist(&db).await {
                    error!("Failed to connect to database: {e}");
                    return Err(rocket);
                }
                info!("...database connection online!");

                Arc::new(MongoLedger::new(client, &db))
            }
        };

        // Manage the state.
        rocket = rocket
            .manage(BallotBox::new(ledger.clone(), config.retry_policy()))
            .manage(TallyReader::new(ledger));
        Ok(rocket)
    }
}

/// Get the name of the database to use (production version).
#[cfg(not(test))]
fn get_database_name(configured: String) -> String {
    configured
}

/// Get the name of the database to use (test version).
/// Use a random name to avoid collisions between tests.
#[cfg(test)]
fn get_database_name(_configured: String) -> String {
    crate::database()
}
