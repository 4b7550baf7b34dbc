#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate backend_test;

use std::sync::Arc;

use rocket::{Build, Rocket};

use crate::config::{ConfigFairing, LedgerFairing};
use crate::engine::{BallotBox, RetryPolicy, TallyReader};
use crate::ledger::Ledger;
use crate::logging::LoggerFairing;

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod model;

/// Build the service with the ledger chosen by configuration.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(LedgerFairing)
}

/// Build the service over an existing ledger, bypassing the storage
/// configuration.
pub fn rocket_for_ledger(ledger: Arc<dyn Ledger>, retry: RetryPolicy) -> Rocket<Build> {
    rocket::build()
        .mount("/", api::routes())
        .attach(LoggerFairing)
        .manage(BallotBox::new(ledger.clone(), retry))
        .manage(TallyReader::new(ledger))
}

/// A local client over the given in-memory ledger. Casts are not retried.
#[cfg(test)]
async fn memory_client(
    ledger: Arc<crate::ledger::MemoryLedger>,
) -> rocket::local::asynchronous::Client {
    logging::init_test_logging();
    rocket::local::asynchronous::Client::tracked(rocket_for_ledger(ledger, RetryPolicy::once()))
        .await
        .unwrap()
}

/// Connect to the test database server, if one is configured via `db_uri`.
#[cfg(test)]
async fn db_client() -> Option<mongodb::Client> {
    let db_uri = rocket::Config::figment()
        .extract_inner::<String>("db_uri")
        .ok()?;
    match mongodb::Client::with_uri_str(&db_uri).await {
        Ok(client) => Some(client),
        Err(e) => {
            log::warn!("Could not connect to test database: {e}");
            None
        }
    }
}

/// A fresh database name, so tests never share state.
#[cfg(test)]
fn database() -> String {
    let random: u32 = rand::random();
    let db = format!("test{random}");
    log::info!("Using database {db}");
    db
}
