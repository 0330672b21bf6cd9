//! # OAI Harvest
//!
//! An incremental OAI-PMH harvester with a durable SQLite store.
//!
//! Each configured target is harvested with `ListRecords`, following
//! resumption tokens page by page. Records are decoded by a format-specific
//! parser and ingested idempotently, so re-running a harvest or running
//! overlapping harvests never duplicates an identifier. The next session
//! resumes from the latest datestamp already stored.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌─────────────┐   ┌──────────────┐   ┌──────────┐
//! │ Transport  │──▶│  Harvester  │──▶│ RecordParser │──▶│  SQLite  │
//! │ HTTP+retry │   │ token loop  │   │ oai_dc/tree  │   │ ids+sets │
//! └────────────┘   └─────────────┘   └──────────────┘   └────┬─────┘
//!                        ▲                                    │
//!                        └──────── from_date seeding ◀────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                  # create database
//! harvest targets               # list configured endpoints
//! harvest run doidb             # incremental harvest of one target
//! harvest run all --full        # re-harvest everything
//! harvest get 10273/IEABC0001   # show a stored identifier
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error types and OAI-PMH error codes |
//! | [`oai`] | `ListRecords` response parsing |
//! | [`protocol`] | Harvest state machine |
//! | [`transport`] | HTTP transport with retry |
//! | [`formats`] | Metadata parsers and the record callback |
//! | [`ingest`] | Idempotent ingestion pipeline |
//! | [`checkpoint`] | Stored harvest progress |
//! | [`session`] | Session coordination and `harvest run` |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod error;
pub mod formats;
pub mod get;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod oai;
pub mod protocol;
pub mod services;
pub mod session;
pub mod stats;
pub mod transport;
