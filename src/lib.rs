//! Channel-agnostic payment division.
//!
//! Splits captured orders among receiver accounts, pushes the split through
//! the channel that processed the payment, and reconciles outcomes that the
//! channel did not confirm in time.

pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod interfaces;
pub mod logging;
