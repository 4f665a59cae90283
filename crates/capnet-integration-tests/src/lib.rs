//! Integration test crate for capnet.
//!
//! This crate exists solely to run integration tests that span the proto,
//! market, agent and daemon crates. It has no public API - all functionality
//! is in the test modules.

#![forbid(unsafe_code)]
