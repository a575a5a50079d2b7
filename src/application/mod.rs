//! Application services: session pool, render pipeline and job mediation.

pub mod artifacts;
pub mod automation;
pub mod compare;
pub mod error;
pub mod mediator;
pub mod pipeline;
pub mod pool;
pub mod raster;
pub mod worker;
