//! Adaptive Split-and-Merge orchestrator: composes the EM
//! factory, splitter and merger over one spatial region's mixture.

use serde::{Deserialize, Serialize};

use crate::em::{self, PartialFittingMask, WeightedEmConfig};
use crate::error::{GuideError, Result};
use crate::mixture::Mixture;
use crate::sample::{self, DirectionalSample};
use crate::split::{self, SplitStatistics};
use crate::suffstats::SufficientStatistics;
use crate::tracing_sink::{TraceEvent, TracingSink};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AsmConfiguration {
    pub splitting_threshold: f64,
    pub merging_threshold: f64,
    pub use_split_and_merge: bool,
    pub partial_refit: bool,
    pub max_split_iterations: usize,
    pub min_samples_for_splitting: u64,
    pub min_samples_for_merging: u64,
    pub min_samples_for_partial_refitting: u64,
    pub weighted_em: WeightedEmConfig,
}

impl Default for AsmConfiguration {
    fn default() -> Self {
        AsmConfiguration {
            splitting_threshold: 0.75,
            merging_threshold: 0.00625,
            use_split_and_merge: true,
            partial_refit: true,
            max_split_iterations: 1,
            min_samples_for_splitting: 4096,
            min_samples_for_merging: 4096,
            min_samples_for_partial_refitting: 128,
            weighted_em: WeightedEmConfig::default(),
        }
    }
}

/// Persistent per-region statistics: sufficient
/// statistics, split statistics and the two since-last counters.
#[derive(Debug, Clone)]
pub struct AsmStatistics {
    pub sufficient: SufficientStatistics,
    pub split: SplitStatistics,
    pub num_samples_since_last_split: u64,
    pub num_samples_since_last_merge: u64,
}

impl AsmStatistics {
    pub fn new(k: usize) -> Self {
        AsmStatistics {
            sufficient: SufficientStatistics::new(k),
            split: SplitStatistics::new(k),
            num_samples_since_last_split: 0,
            num_samples_since_last_merge: 0,
        }
    }

    fn assert_component_counts_match(&self, mix: &Mixture) {
        assert_eq!(mix.num_components(), self.sufficient.num_components());
        assert_eq!(mix.num_components(), self.split.num_components());
    }
}

/// Reported back to the caller after every `fit`/`update` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsmFittingStatistics {
    pub num_samples: u64,
    pub num_invalid_samples: u64,
    pub num_splits: u64,
    pub num_merges: u64,
    pub num_update_em_iterations: u64,
    pub num_partial_update_em_iterations: u64,
    pub capacity_exceeded: bool,
    pub error: bool,
}

/// Cold-start fit: seeds a `k`-component mixture, runs
/// recursive splitting, then a merge pass, then refreshes distances.
pub fn fit(
    k: usize,
    samples: &[DirectionalSample],
    cfg: &AsmConfiguration,
    sink: &mut dyn TracingSink,
) -> Result<(Mixture, AsmStatistics, AsmFittingStatistics)> {
    let (valid, dropped) = sample::filter_valid(samples);
    let mut fit_stats = AsmFittingStatistics {
        num_invalid_samples: dropped as u64,
        ..Default::default()
    };

    let (mut mix, mut suff, em_stats) = em::fit_mixture(k, &valid, &cfg.weighted_em)?;
    fit_stats.num_samples = valid.len() as u64;
    fit_stats.num_update_em_iterations = em_stats.num_iterations as u64;

    let mut split_stats = SplitStatistics::new(mix.num_components());

    if cfg.use_split_and_merge {
        let splits = split::perform_recursive_splitting(
            &mut mix,
            &mut split_stats,
            &valid,
            cfg.splitting_threshold,
            cfg.max_split_iterations,
            sink,
        );
        fit_stats.num_splits = splits as u64;
        if mix.num_components() >= crate::mixture::K_MAX {
            fit_stats.capacity_exceeded = true;
        }

        split::calculate_split_statistics(&mix, &valid, &mut split_stats);
        suff.set_num_components(mix.num_components());

        let merges =
            crate::merge::perform_merging(&mut mix, &mut suff, &mut split_stats, cfg.merging_threshold, sink);
        fit_stats.num_merges = merges as u64;
    } else {
        suff.set_num_components(mix.num_components());
    }

    em::init_component_distances(&mut mix, &valid);

    if !mix.is_valid() {
        return Err(GuideError::CorruptedState {
            reason: "mixture failed validity check after fit",
        });
    }

    sink.emit(TraceEvent::ComponentCount(mix.num_components()));

    let stats = AsmStatistics {
        sufficient: suff,
        split: split_stats,
        num_samples_since_last_split: 0,
        num_samples_since_last_merge: 0,
    };
    stats.assert_component_counts_match(&mix);

    Ok((mix, stats, fit_stats))
}

/// Warm update: online EM, split-statistic
/// accumulation, conditional split pass with optional partial refit, and
/// conditional merge pass.
pub fn update(
    mix: &mut Mixture,
    stats: &mut AsmStatistics,
    samples: &[DirectionalSample],
    cfg: &AsmConfiguration,
    sink: &mut dyn TracingSink,
) -> Result<AsmFittingStatistics> {
    stats.assert_component_counts_match(mix);

    let (valid, dropped) = sample::filter_valid(samples);
    let mut fit_stats = AsmFittingStatistics {
        num_invalid_samples: dropped as u64,
        num_samples: valid.len() as u64,
        ..Default::default()
    };

    let em_stats = match em::update_mixture(mix, &mut stats.sufficient, &valid, &cfg.weighted_em) {
        Ok(s) => s,
        Err(GuideError::NumericDegeneracy { reason }) => {
            fit_stats.error = true;
            sink.emit(TraceEvent::Degenerate { reason });
            return Ok(fit_stats);
        }
        Err(e) => return Err(e),
    };
    fit_stats.num_update_em_iterations = em_stats.num_iterations as u64;

    if !cfg.use_split_and_merge {
        stats.split.set_num_components(mix.num_components());
        sink.emit(TraceEvent::ComponentCount(mix.num_components()));
        return Ok(fit_stats);
    }

    let mc_estimate = split::update_split_statistics(mix, &valid, &mut stats.split);
    sink.emit(TraceEvent::McEstimate(mc_estimate));
    stats.num_samples_since_last_split += valid.len() as u64;
    stats.num_samples_since_last_merge += valid.len() as u64;

    if stats.num_samples_since_last_split >= cfg.min_samples_for_splitting {
        let candidates = split::split_candidates(&stats.split, cfg.splitting_threshold);
        let mut mask = PartialFittingMask::reset_to_false();
        let mut any_split = false;

        for candidate in candidates {
            if mix.num_components() >= crate::mixture::K_MAX {
                fit_stats.capacity_exceeded = true;
                break;
            }
            let parent = candidate.component;
            if split::split_component(mix, &mut stats.split, parent) {
                let child = mix.num_components() - 1;
                mask.set_to_true(parent);
                mask.set_to_true(child);
                fit_stats.num_splits += 1;
                any_split = true;
                stats.sufficient.set_num_components(mix.num_components());
                sink.emit(TraceEvent::SplitPerformed { parent, child });
            } else {
                sink.emit(TraceEvent::SplitRefused { component: parent });
            }
        }

        if any_split && cfg.partial_refit && valid.len() as u64 >= cfg.min_samples_for_partial_refitting {
            let mut temp_suff = SufficientStatistics::new(mix.num_components());
            let partial_stats =
                em::partial_update_mixture(mix, &mask, &mut temp_suff, &valid, &cfg.weighted_em)?;
            fit_stats.num_partial_update_em_iterations = partial_stats.num_iterations as u64;
            let mask_vec: Vec<bool> = (0..mix.num_components()).map(|k| mask.get(k)).collect();
            stats.sufficient.masked_replace(&mask_vec, &temp_suff);
        }

        stats.num_samples_since_last_split = 0;
    }

    if stats.num_samples_since_last_merge >= cfg.min_samples_for_merging {
        let merges = crate::merge::perform_merging(
            mix,
            &mut stats.sufficient,
            &mut stats.split,
            cfg.merging_threshold,
            sink,
        );
        fit_stats.num_merges = merges as u64;
        stats.num_samples_since_last_merge = 0;
    }

    em::init_component_distances(mix, &valid);

    if !mix.is_valid() {
        return Err(GuideError::CorruptedState {
            reason: "mixture failed validity check after update",
        });
    }
    stats.assert_component_counts_match(mix);
    sink.emit(TraceEvent::ComponentCount(mix.num_components()));

    Ok(fit_stats)
}
