//! Offline-first sync layer for EMS field triage.
//!
//! REST client, reconnecting push sockets, and a local object cache with
//! live queries that report change sets.

pub mod api;
pub mod cache;
pub mod config;
pub mod daemon;
pub mod error;
pub mod event;
pub mod logging;
pub mod model;
pub mod query;
pub mod socket;
