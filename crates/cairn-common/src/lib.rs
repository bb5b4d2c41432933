//! Cairn Common - Shared types and utilities
//!
//! This crate provides the object model, error definitions, configuration
//! structures and integrity helpers used by every Cairn component.

pub mod checksum;
pub mod config;
pub mod epoch;
pub mod error;
pub mod mode;
pub mod types;

pub use checksum::{Checksum, payload_checksum};
pub use config::ShardConfig;
pub use epoch::{Epoch, EpochCounter, EpochState};
pub use error::{Error, Result};
pub use mode::Mode;
pub use types::*;
