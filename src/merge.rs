//! Similar-lobe merging.

use crate::lobe::{self, VmfLobe};
use crate::mixture::Mixture;
use crate::split::SplitStatistics;
use crate::suffstats::SufficientStatistics;
use crate::tracing_sink::{TraceEvent, TracingSink};

/// Closed-form product-integral (Bhattacharyya-style) divergence between
/// two vMF lobes: `D(a, b) = 1 - integral sqrt(f_a * f_b) dw`. For vMF this
/// reduces to a ratio of normalisation constants evaluated at the
/// geometric-mean concentration and direction.
pub fn divergence(a: VmfLobe, b: VmfLobe) -> f64 {
    let kappa_c = lobe::norm(lobe::add(
        lobe::scale(a.mu, a.kappa * 0.5),
        lobe::scale(b.mu, b.kappa * 0.5),
    ));
    let bhattacharyya_coefficient =
        (lobe::normalization(a.kappa).sqrt() * lobe::normalization(b.kappa).sqrt() / lobe::normalization(kappa_c))
            .min(1.0);
    (1.0 - bhattacharyya_coefficient).max(0.0)
}

#[derive(Debug, Clone, Copy)]
struct MergeCandidate {
    a: usize,
    b: usize,
    score: f64,
}

fn best_merge_candidate(mix: &Mixture) -> Option<MergeCandidate> {
    let k = mix.num_components();
    let mut best: Option<MergeCandidate> = None;
    for a in 0..k {
        for b in (a + 1)..k {
            let d = divergence(mix.lobe(a), mix.lobe(b));
            let score = (mix.weight(a) + mix.weight(b)) * d;
            if best.map(|c| score < c.score).unwrap_or(true) {
                best = Some(MergeCandidate { a, b, score });
            }
        }
    }
    best
}

/// Merges mixture components `a` and `b` in place: weighted mean direction
/// and concentration, harmonic-mean pivot distance; the last component is
/// compacted into whichever of `a`/`b` is vacated. Sufficient and split
/// statistics are kept component-aligned with the mixture the same way.
fn merge_pair(
    mix: &mut Mixture,
    suff: &mut SufficientStatistics,
    split_stats: &mut SplitStatistics,
    a: usize,
    b: usize,
) {
    let w_a = mix.weight(a);
    let w_b = mix.weight(b);
    let w_sum = w_a + w_b;
    let lobe_a = mix.lobe(a);
    let lobe_b = mix.lobe(b);

    let combined = lobe::add(lobe::scale(lobe_a.mu, w_a), lobe::scale(lobe_b.mu, w_b));
    let r = lobe::norm(combined) / w_sum.max(1.0e-300);
    let mu = if lobe::norm(combined) > 0.0 {
        lobe::normalize(combined)
    } else {
        lobe_a.mu
    };
    let kappa = lobe::kappa_from_mean_cosine(r.clamp(0.0, 1.0 - 1.0e-6));

    let d_a = mix.pivot_distance(a);
    let d_b = mix.pivot_distance(b);
    let pivot_distance = if d_a > 0.0 && d_b > 0.0 {
        w_sum / (w_a / d_a + w_b / d_b)
    } else {
        d_a.max(d_b)
    };

    mix.set_component(a, w_sum, VmfLobe::new(mu, kappa), pivot_distance);

    let merged_gamma = suff.sum_gamma(a) + suff.sum_gamma(b);
    let merged_omega = lobe::add(suff.sum_gamma_omega(a), suff.sum_gamma_omega(b));
    let merged_inv_distance = suff.sum_gamma_inv_distance(a) + suff.sum_gamma_inv_distance(b);
    suff.overwrite_component(a, merged_gamma, merged_omega, merged_inv_distance);
    split_stats.zero_component(a);

    let last = mix.num_components() - 1;
    if b != last {
        move_component(mix, last, b);
        suff.move_component(last, b);
        split_stats.move_component(last, b);
    } else {
        suff.zero_component(b);
        split_stats.zero_component(b);
    }

    mix.set_num_components(last);
    suff.set_num_components(last);
    split_stats.set_num_components(last);
    mix.renormalize_weights();
}

fn move_component(mix: &mut Mixture, src: usize, dst: usize) {
    mix.set_component(dst, mix.weight(src), mix.lobe(src), mix.pivot_distance(src));
}

/// Repeatedly finds and merges the pair with smallest weighted divergence
/// until no pair is at or below `threshold`, or only one component remains.
/// Returns the number of merges performed.
pub fn perform_merging(
    mix: &mut Mixture,
    suff: &mut SufficientStatistics,
    split_stats: &mut SplitStatistics,
    threshold: f64,
    sink: &mut dyn TracingSink,
) -> usize {
    let mut merges = 0usize;
    loop {
        if mix.num_components() <= 1 {
            break;
        }
        match best_merge_candidate(mix) {
            Some(candidate) if candidate.score <= threshold => {
                merge_pair(mix, suff, split_stats, candidate.a, candidate.b);
                sink.emit(TraceEvent::MergePerformed { a: candidate.a, b: candidate.b });
                merges += 1;
            }
            _ => break,
        }
    }
    merges
}
