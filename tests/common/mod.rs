//! Shared test utilities for integration, chaos and property tests.
//!
//! This module provides:
//! - Redis testcontainer setup
//! - A deterministic history generator
//! - Recording / failure-injecting collaborators

#![allow(dead_code)]

pub mod containers;
pub mod generator;
pub mod mocks;

pub use containers::*;
pub use generator::*;
pub use mocks::*;
