//! Configuration loading for the `scanfleet-server` binary.

pub mod config;
