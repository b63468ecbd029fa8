//! # Cairn Core
//!
//! Client library for a replicated key-value configuration store.
//!
//! This crate provides:
//!
//! - **[`replica`]**: Replica pool with static and discovered endpoints, per-endpoint
//!   exponential backoff, and a failover executor that races a parallel attempt against a
//!   slow replica.
//!
//! - **[`watch`]**: Watched keys with per-key cache expiration and single-flight refresh
//!   guards.
//!
//! - **[`refresh`]**: Initial load with startup retry, selective change detection, and the
//!   background refresh loop.
//!
//! - **[`adapter`]**: Value transformation pipeline (e.g. JSON flattening) and key-prefix
//!   trimming.
//!
//! - **[`snapshot`]**: Immutable configuration snapshots published atomically.
//!
//! - **[`provider`]**: The [`ConfigProvider`] facade and its builder.
//!
//! - **[`config`]**, **[`logging`]**, **[`metrics`]**: Layered configuration, tracing setup
//!   and metric recording.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ConfigProvider                        │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │                 RefreshOrchestrator                  │    │
//! │  │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐  │    │
//! │  │  │ WatchedKey   │ │   Adapter    │ │  Snapshot    │  │    │
//! │  │  │  Registry    │ │  Pipeline    │ │   Store      │  │    │
//! │  │  └──────────────┘ └──────────────┘ └──────┬───────┘  │    │
//! │  └──────────────┬───────────────────────────┼───────────┘    │
//! │                 │                           │                │
//! │        ┌────────▼─────────┐          ┌──────▼──────┐         │
//! │        │ FailoverExecutor │          │ Subscribers │         │
//! │        └────────┬─────────┘          └─────────────┘         │
//! │        ┌────────▼─────────┐                                  │
//! │        │ReplicaClientPool │◄── ReplicaDiscovery               │
//! │        └──────────────────┘                                  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Refresh Flow
//!
//! ```text
//! tick ──► due watched keys ──► check_changed (per key, concurrent)
//!                                   │
//!              ┌────────────────────┼─────────────────────┐
//!              ▼                    ▼                     ▼
//!          Unchanged         Modified/Missing      refresh_all key
//!              │                    │                 changed
//!              │             re-fetch, adapt              │
//!              │             and merge one key        full reload
//!              │                    │                     │
//!              ▼                    └─────────┬───────────┘
//!        no publish                           ▼
//!                                   publish new snapshot
//! ```

pub mod adapter;
pub mod config;
pub mod logging;
pub mod metrics;
pub mod provider;
pub mod refresh;
pub mod replica;
pub mod snapshot;
pub mod types;
pub mod watch;

pub use provider::{BuilderError, ConfigProvider, ConfigProviderBuilder};
pub use refresh::ProviderError;
