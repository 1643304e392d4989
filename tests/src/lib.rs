//! Shared fixtures and test suites for bfxlink
//!
//! [`harness`] wraps a session over the in-memory loopback transport so
//! suites can play the server side frame by frame.

pub mod harness;


#[cfg(test)]
mod session_tests;
