//! # docwatch Engine
//!
//! Client-side realtime query watch engine.
//!
//! This crate provides:
//! - Target change aggregation (pending changes buffered until consistent)
//! - View diffs producing ordered `DocumentChange`s
//! - A single multiplexed watch stream with reconnect and resume tokens
//! - Listener dispatch with late-joiner priming and panic isolation
//! - A mock transport for tests
//!
//! ## Architecture
//!
//! ```text
//! WatchEngine::listen ──> TargetRegistry ──> stream task ──> WatchTransport
//!                                               │
//!        listeners <── View::apply <── TargetAggregator <── RawChange
//! ```
//!
//! ## Key Invariants
//!
//! - Nothing reaches a listener before the target's consistency marker
//! - Identical queries share one target; every listener gets its own
//!   complete first snapshot
//! - A listener sees at most one terminal error and nothing after it
//! - Messages for one target are processed in arrival order

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod aggregator;
mod config;
mod engine;
mod error;
mod listener;
mod snapshot;
mod stream;
mod target;
mod transport;
mod view;

pub use aggregator::{AggregatorState, PendingChange, PendingChangeSet, TargetAggregator};
pub use config::{BackoffConfig, WatchConfig};
pub use engine::{WatchEngine, WatchStats};
pub use error::{WatchError, WatchResult};
pub use listener::{ErrorCallback, ListenerId, ListenerRegistration, SnapshotCallback};
pub use snapshot::{ChangeType, DocumentChange, QuerySnapshot};
pub use stream::StreamState;
pub use transport::{MockServer, MockServerStream, MockTransport, WatchStream, WatchTransport};
pub use view::{View, ViewChange};
