//! Drive API access for drivefs.
//!
//! [`DriveClient`] speaks the drive's HTTP API; [`MemoryDrive`] implements the
//! same contract in memory. Token persistence and the periodic refresher live
//! in [`token`].

pub mod api;
pub mod client;
pub mod memory;
pub mod token;

pub use client::{DriveClient, Endpoints};
pub use memory::{Faults, MemoryDrive, MemoryStats};
pub use token::{normalize_token, refresh_once, spawn_refresh_loop, TokenStore};
