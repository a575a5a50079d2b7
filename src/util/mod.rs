//! Small helpers shared across layers.

pub mod host;
pub(crate) mod lock;
