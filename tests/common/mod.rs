//! Shared test utilities for integration and property tests.
//!
//! This module provides:
//! - Redis testcontainer setup with a change-feed writer
//! - In-memory source, sink and checkpoint store with fault injection
//! - Change event helpers

#![allow(dead_code)]

pub mod containers;
pub mod mocks;

pub use containers::*;
pub use mocks::*;
