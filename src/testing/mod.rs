//! Testing utilities and mock implementations
//!
//! Mocks for the browser session, document sources, the control channel and
//! metadata providers, so the lifecycle can be exercised without Chromium, a
//! broker or the network. [`fixtures`] generates small PDFs for the sanitizer.

pub mod fixtures;
pub mod mocks;

pub use mocks::*;
