//! Embedded knowledge store for AI-assistant memory.
//!
//! Cairn keeps everything in one SQLite file that several short-lived
//! processes (one per captured event) and one long-lived serving process
//! open concurrently. It stores observations, session boundaries, a
//! tool-usage ledger, and learned topic-shift thresholds, all partitioned
//! by a caller-supplied key.
//!
//! # Architecture
//!
//! - **Storage**: SQLite in WAL mode, versioned migrations that may be gated
//!   on optional capabilities
//! - **Keyword search**: FTS5 external-content indexes kept in sync by triggers
//! - **Vector search**: [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   when it loads; keyword-only operation otherwise
//! - **Fusion**: Reciprocal Rank Fusion of the keyword and vector rankings
//! - **Topic shifts**: EWMA-adaptive threshold over consecutive embedding
//!   distances, seeded from past sessions
//!
//! # Modules
//!
//! - [`config`]: configuration from TOML files and environment variables
//! - [`db`]: connection lifecycle, pragmas, capability detection, migrations
//! - [`memory`]: observations, sessions, the tool registry, and statistics
//! - [`search`]: sanitized keyword search, vector KNN, and rank fusion
//! - [`shift`]: adaptive topic-shift detection and its persisted history
//! - [`capture`]: the one-event-per-process write path
//! - [`worker`]: background embedding, checkpointing, and registry sweeps
//! - [`embedding`]: the embedding provider seam and vector helpers

pub mod capture;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod search;
pub mod shift;
pub mod worker;

pub use error::{Error, Result};
