//! Test module for plugmon-core
//!
//! This module contains tests for:
//! - Identity resolution, registration and persistence of services
//! - Handler matching, concurrent dispatch and failure isolation
//! - Connection loops: greeting, ordering, backpressure, rejection and close

mod connection_tests;
mod fixtures;
