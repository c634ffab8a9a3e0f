//! # ichat-store
//!
//! Durable device-local state for the ichat client, backed by SQLite.
//!
//! Only two things ever touch disk: the local identity secret and the
//! offline send queue. Everything else the client knows is either held in
//! memory for the lifetime of the process or fetched from the record store.

pub mod database;
pub mod identity;
pub mod migrations;
pub mod models;
pub mod queue;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
