//! Per-region fan-out helpers: the core is single-threaded per
//! region, so a render-time scheduler that trains many regions at once
//! just needs one independent `fit`/`update` call per region, issued on
//! whatever thread pool it already has. These wrap that pattern with
//! `rayon` since every region's work here is embarrassingly parallel and
//! owns its own mixture and statistics.

use rayon::prelude::*;

use crate::asm::{self, AsmConfiguration, AsmFittingStatistics, AsmStatistics};
use crate::error::Result;
use crate::mixture::Mixture;
use crate::sample::DirectionalSample;
use crate::tracing_sink::NullTracingSink;

/// One region's inputs for a cold-start fit.
pub struct FitJob<'a> {
    pub initial_components: usize,
    pub samples: &'a [DirectionalSample],
}

/// One region's inputs for a warm update: the mixture and statistics are
/// taken by value since `update` mutates them in place and the caller gets
/// them back alongside the fitting statistics.
pub struct UpdateJob<'a> {
    pub mixture: Mixture,
    pub stats: AsmStatistics,
    pub samples: &'a [DirectionalSample],
}

/// Runs a cold-start `fit` per job across a rayon thread pool; each job is
/// fully independent, so results come back in the same order as `jobs`
/// with no cross-job synchronisation.
pub fn fit_regions_parallel(
    jobs: &[FitJob],
    cfg: &AsmConfiguration,
) -> Vec<Result<(Mixture, AsmStatistics, AsmFittingStatistics)>> {
    jobs.par_iter()
        .map(|job| {
            let mut sink = NullTracingSink;
            asm::fit(job.initial_components, job.samples, cfg, &mut sink)
        })
        .collect()
}

/// Runs a warm `update` per job across a rayon thread pool, returning each
/// job's mixture, statistics and fitting statistics once mutated.
pub fn update_regions_parallel(
    jobs: Vec<UpdateJob>,
    cfg: &AsmConfiguration,
) -> Vec<Result<(Mixture, AsmStatistics, AsmFittingStatistics)>> {
    jobs.into_par_iter()
        .map(|mut job| {
            let mut sink = NullTracingSink;
            let fit_stats = asm::update(&mut job.mixture, &mut job.stats, job.samples, cfg, &mut sink)?;
            Ok((job.mixture, job.stats, fit_stats))
        })
        .collect()
}
