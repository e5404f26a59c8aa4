//! Online path-guiding distribution estimator: a parallax-aware mixture of
//! von Mises-Fisher lobes on the unit sphere, fit incrementally from
//! streamed directional radiance samples via weighted EM with data-driven
//! component splitting and merging.
//!
//! The [`asm`] module is the entry point most callers want: [`asm::fit`]
//! for a region's first batch, [`asm::update`] for every batch after.
//! [`query::SurfaceSamplingDistribution`] wraps a fitted [`mixture::Mixture`]
//! for per-sample use at render time.

pub mod asm;
pub mod config;
pub mod em;
pub mod error;
pub mod lobe;
pub mod merge;
pub mod mixture;
pub mod parallel;
pub mod query;
pub mod sample;
pub mod split;
pub mod suffstats;
pub mod tracing_sink;

pub use error::{GuideError, Result};
