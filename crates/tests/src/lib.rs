//! Integration Tests for Cairn
//!
//! This crate contains the following test modules:
//!
//! - `failover_tests`: replica ordering, backoff, parallel fallback and page pinning
//! - `refresh_tests`: sentinel reloads, point refreshes, snapshot atomicity and adapter failures
//! - `discovery_tests`: discovered replicas, rediscovery rate limiting and lookup failures
//! - `provider_tests`: end-to-end behavior of the `ConfigProvider` facade
//! - `mock_infrastructure`: reusable mock store, client factory and discovery
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test --package tests
//! ```
//!
//! Every test runs on a paused tokio clock, so backoff and expiration
//! intervals elapse instantly and deterministically.

#[cfg(test)]
mod discovery_tests;


#[cfg(test)]
mod provider_tests;

#[cfg(test)]
mod refresh_tests;
