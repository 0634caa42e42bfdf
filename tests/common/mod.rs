//! Shared test utilities for the integration suites.
//!
//! This module provides:
//! - MongoDB replica-set testcontainer setup
//! - In-memory coordinator fixtures and polling helpers

#![allow(dead_code)]

pub mod containers;
pub mod fixtures;

pub use containers::*;
pub use fixtures::*;
