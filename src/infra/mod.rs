//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod http;
pub mod imagemagick;
pub mod supervisor;
pub mod telemetry;
pub mod webdriver;
