//! NUT (Network UPS Tools) protocol client and canonical mapper.
//!
//! `client` speaks the line-based TCP protocol (`LIST VAR`, optional
//! `USERNAME`/`PASSWORD` handshake); `mapper` turns the raw variable map
//! into a typed [`vlt_schemas::UpsSnapshot`] with no I/O.

pub mod client;
pub mod mapper;

pub use client::{NutClient, NutClientConfig, NutError, NutFetcher};
pub use mapper::map_snapshot;
