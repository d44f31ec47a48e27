//! # CQS Bus Test Suite
//!
//! Cross-component flows: real buses and listeners wired through the
//! in-memory transport.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs        # Messages, handlers and helpers shared by flows
//! └── integration/
//!     ├── request_reply.rs   # Requests, queries, faults, correlation
//!     ├── command_event.rs   # One-way flows and dispositions
//!     └── shutdown.rs        # Lifecycle, draining and fatal failures
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p cqs-tests
//! cargo test -p cqs-tests integration::shutdown::
//! ```

pub mod fixtures;
pub mod integration;
