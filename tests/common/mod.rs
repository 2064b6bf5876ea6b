//! Common test utilities for usenet-indexer integration tests

#[allow(dead_code)]
pub mod fake_server;
#[allow(dead_code)]
pub mod live;

pub use fake_server::*;
#[allow(unused_imports)]
pub use live::*;
