//! # docwatch Testkit
//!
//! Test utilities for docwatch.
//!
//! This crate provides:
//! - Document fixtures
//! - A recording listener with timed waits
//! - A scripted server over the engine's mock transport
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use docwatch_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn first_snapshot() {
//!     let (engine, mut server) = start_engine(WatchConfig::default());
//!     let mut recorder = RecordingListener::new();
//!     recorder.listen(&engine, &QueryDescriptor::collection("items")).unwrap();
//!
//!     let mut stream = accept_stream(&mut server).await;
//!     let (target, _) = stream.expect_add().await;
//!     stream.consistent(target, "t1", 1);
//!     assert!(recorder.next_snapshot().await.is_empty());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;

use std::sync::Once;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::init_tracing;
    pub use docwatch_engine::{
        ChangeType, QuerySnapshot, StreamState, WatchConfig, WatchEngine, WatchError,
    };
    pub use docwatch_protocol::{
        DocumentKey, FieldOperator, ListenRequest, OrderBy, QueryDescriptor, Status, StatusCode,
        TargetId, Value,
    };
}

pub use fixtures::*;
pub use generators::*;

static TRACING: Once = Once::new();

/// Installs a test subscriber honouring `RUST_LOG`. Safe to call from every
/// test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
