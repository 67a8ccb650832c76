//! Hierarchical vaccine stock lot ledger
//!
//! Tracks physical vaccine inventory as discrete, expiring lots owned by a
//! position in the national/regional/district/health-center hierarchy.
//! Consumption is allocated earliest-expiration-first, every downward
//! transfer leaves an audit record and a lineage of derived lots, single
//! doses can be reserved for scheduled appointments, and a lot can be
//! deleted together with everything derived from it while the cached
//! per-(vaccine, owner) counters stay consistent.
//!
//! All operations run on a [`service::UnitOfWork`]; nothing is persisted
//! until it commits.

pub mod aggregate;
pub mod error;
mod keys;
pub mod lot;
pub mod owner;
pub mod reservation;
pub mod service;
pub mod transfer;
pub mod utils;
