//! # Draw Tasks
//!
//! Asynchronous task units for a remote image-generation ("draw") API.
//!
//! ## Features
//!
//! - Submit-then-poll lifecycle with one-shot result download
//! - Cooperative cancellation, checked every half second
//! - Bounded tolerance of transient network failures
//! - Keyed registry with at most one live unit per caller handle
//! - Optional auto-retry wrapper
//! - SQLite generation history
//! - Progress/finished notifications over a channel or as Tauri events
//!   (`tauri` feature)
//!
//! ## Quick Start
//!
//! 1. Load an [`AppConfig`] (or build a [`DrawClient`] directly)
//! 2. Create a [`TaskManager`] with an event sink such as [`ChannelSink`]
//! 3. Start requests with [`TaskManager::start()`]
//! 4. Call [`TaskManager::stop_all()`] at shutdown

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod history;
pub mod manager;
pub mod registry;
pub mod retry;
pub mod storage;
pub mod types;
pub mod unit;

pub use client::{DrawApi, DrawClient};
pub use config::{AppConfig, TaskConfig, TaskConfigBuilder};
pub use error::{ApiError, ConfigError, HistoryError, TaskFailure};
pub use events::{
    ChannelSink, TaskEvent, TaskEventSink, TaskFinishedEvent, TaskProgressEvent, TaskRetryEvent,
};
pub use history::{HistoryEntry, HistoryLedger, HistoryStatus, HistoryUpdate, SqliteLedger};
pub use manager::TaskManager;
pub use registry::TaskRegistry;
pub use retry::{RetryPolicy, RetryingUnit};
pub use types::{DrawRequest, Envelope, JobStatus, ModelFamily, PollData, TaskOutcome};
pub use unit::{JobSlot, TaskRun, TaskUnit, UnitHandle};
