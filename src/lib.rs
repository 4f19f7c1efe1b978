//! # gearflow
//!
//! A durable discovery pipeline core.
//!
//! Producers scan external sources and emit discoveries. A source registry
//! keeps them from rescanning the same location, a priority work queue hands
//! each discovery to exactly one researcher, and a research ledger records
//! every consulted source and gates promotion on completeness and
//! confidence. An orchestration flow drives the stages and checkpoints its
//! state after each one so a restart resumes where it stopped.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  scan   ┌──────────────┐  claim  ┌────────────────┐
//! │ Scanners │───────▶│ Discovery     │───────▶│ ResearchExecutor │
//! │          │        │ Queue         │        └───────┬────────┘
//! └────┬─────┘        └──────────────┘                │ log steps
//!      │ record                                        ▼
//!      ▼                                        ┌──────────────┐
//! ┌──────────┐                                  │ Research     │
//! │ Source   │        ┌──────────────┐  load    │ Ledger       │
//! │ Registry │        │ Loader       │◀────────┴──────────────┘
//! └──────────┘        └──────────────┘
//!
//!          FlowCoordinator ── snapshot after every stage ──▶ SQLite
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! gearflow init
//! gearflow queue enqueue --kind brand --name Zpacks --source-url https://zpacks.com
//! gearflow queue next --worker me
//! gearflow stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and sentinel outcomes |
//! | [`error`] | Typed store errors |
//! | [`db`] | Database connection and store bundle |
//! | [`migrate`] | Schema migrations |
//! | [`registry`] | Source registry |
//! | [`queue`] | Priority discovery queue |
//! | [`ledger`] | Append-only research ledger |
//! | [`snapshot`] | Flow state snapshot and persistence |
//! | [`traits`] | Collaborator seams |
//! | [`retry`] | Back-off for collaborator calls |
//! | [`flow`] | Orchestration flow coordinator |
//! | [`commands`] | CLI presentation |
//! | [`stats`] | Store summary |

pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod flow;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod snapshot;
pub mod stats;
pub mod traits;
