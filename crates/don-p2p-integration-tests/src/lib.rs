//! Integration test crate for the multi-DON peer transport.
//!
//! This crate exists solely to run tests that drive several peer services
//! over a shared in-memory network. It has no public API - all functionality
//! is in the test modules.

#![forbid(unsafe_code)]
