//! Trusted local development network.
//!
//! A per-user daemon answers DNS for a reserved TLD and publishes the local
//! root CA over HTTPS. [`control::Supervisor`] installs it with the host's
//! service manager, and [`trust::TrustManager`] places the root CA into the
//! system, browser and runtime trust stores.

pub mod command;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod ports;
pub mod resolver;
pub mod runtime;
pub mod trust;
