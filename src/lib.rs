//! Pet-care voice assistant core
//!
//! The always-on half of a voice assistant for pet owners:
//! - Wake-word monitoring on a background worker
//! - A bounded, persistent cache of synthesized responses
//! - A performance optimizer watching latency, frame pacing and memory
//!
//! # Architecture
//!
//! ```text
//! microphone ──▶ WakeWordMonitor ──▶ wake event ──▶ (recognition, intent,
//!                 (worker thread)                   execution: downstream)
//!                                                          │
//!                  ResponseCache ◀── respond(text) ◀───────┘
//!                 (SQLite store)          │
//!                        │                ▼
//!                        └──hit rate──▶ PerformanceOptimizer ◀── latency,
//!                                        frame rate, memory samplers
//! ```

pub mod assistant;
pub mod cache;
pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod perf;
pub mod voice;

pub use assistant::{Assistant, Response};
pub use cache::{CacheStats, CachedAudio, ResponseCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::{DbConn, DbPool};
pub use engine::{CommandTranscriber, Synthesizer, Transcriber};
pub use error::{Error, Result};
pub use perf::{PerformanceOptimizer, PerformanceReport, Stage};
pub use voice::{WakeEvent, WakeWordMonitor};
