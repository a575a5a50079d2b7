//! Supervised render server for Beeminder goal graphs.
//!
//! A `serve` process supervises render workers. Each worker owns a WebDriver
//! server, a bounded pool of browser sessions and an HTTP listener shared with
//! its siblings through `SO_REUSEPORT`.

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
pub mod util;
