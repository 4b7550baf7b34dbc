//! Data types: `db` is what the ledger stores, `api` is what the HTTP
//! surface sends and receives.

pub mod api;
pub mod common;
pub mod db;
pub mod mongodb;
