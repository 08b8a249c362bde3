//! # peerdrive-store
//!
//! The versioned, content-addressed store behind every drive.
//!
//! A drive directory holds a SQLite database (the file tree plus a signed,
//! append-only op log) and a `blobs/` directory of BLAKE3-addressed files.
//! Only the holder of the drive's secret key can append; everyone else
//! applies verified ops received from peers. [`DriveStore`] is the async
//! handle the rest of the application works with.

pub mod blobs;
pub mod database;
pub mod drive;
pub mod entries;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use drive::{BlobStream, DriveStore};
pub use error::StoreError;
pub use models::*;
