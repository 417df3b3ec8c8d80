// crates/monitor/src/lib.rs
//! Terminal-output ingestion pipeline for the agent console.
//!
//! Tails each monitored instance's growing transcript, strips interface
//! noise, re-segments the stream into speaker-attributed messages,
//! deduplicates against recorded history, persists the reconstructed
//! conversation, and fans out fragment/complete events to live subscribers.
//!
//! Data flows strictly downward:
//!
//! ```text
//! MonitoredSource (cursor-tracked reader)
//!   └─> EscapeFilter (agent-console-core)
//!         └─> SpeakerSegmenter (agent-console-core)
//!               └─> ConversationStore (dedup + persistence)
//!                     └─> StreamingPublisher (per-instance broadcast)
//! ```
//!
//! [`MonitorManager`] drives the chain with one poll task per instance and
//! is the only component aware of all the others.

pub mod config;
pub mod manager;
pub mod publish;
pub mod reader;
pub mod store;

pub use config::MonitorConfig;
pub use manager::MonitorManager;
pub use publish::StreamingPublisher;
pub use reader::{MonitoredSource, RawChunk};
pub use store::ConversationStore;
