//! # Pong Test Suite
//!
//! Cross-component tests for the event bus.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── stub_consul.rs    # Minimal Consul agent (event list/fire) on axum
//! └── integration/
//!     ├── flows.rs      # Bus ↔ bus flows over the in-memory log
//!     └── consul.rs     # Bus ↔ Consul HTTP adapter against the stub agent
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p pong-tests
//! cargo test -p pong-tests integration::consul::
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod stub_consul;
