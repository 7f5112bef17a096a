//! flowrun - crash-safe data-pipeline run engine
//!
//! flowrun drives **works** (single executable units: a bash script, a Spark
//! SQL submission) and **workflows** (DAGs of works) from submission to a
//! terminal state. The heart of the crate is a resumable, idempotent,
//! lock-coordinated state machine: every active run is re-ticked by a
//! per-run timer, each tick replays the same step sequence, and a persisted
//! step ledger guarantees that no numbered step applies twice even across
//! process restarts or concurrent re-entrant triggers.
//!
//! ## Key pieces
//!
//! - **Step ledger**: an append-only process counter per run; the ledger
//!   write is the commit point for externally visible side effects.
//! - **Distributed locker**: named locks backed by the shared database,
//!   serializing status transitions on a workflow run.
//! - **DAG fan-out/fan-in**: a completed node arms its children; the run
//!   group finalizes once every end node is terminal.
//! - **Pluggable executors**: per-work-type `execute`/`abort` plug-ins; the
//!   state machine never knows what a work actually does.
//!
//! ## Example
//!
//! ```no_run
//! use flowrun::config::Config;
//! use flowrun::engine::Engine;
//!
//! # async fn run() -> flowrun::Result<()> {
//! let engine = Engine::open(Config::load())?;
//! let instance_id = engine.submit_work("my-work-id").await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod executors;
pub mod notify;
pub mod storage;
pub mod telemetry;
pub mod triggers;
pub mod workflow;

pub use engine::Engine;
pub use error::{Error, Result};
