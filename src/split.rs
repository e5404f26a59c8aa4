//! Split diagnostics and component splitting.
//!
//! Each mixture component carries a running chi-squared accumulator plus a
//! 3x3 angular-covariance outer-product accumulator; the latter's principal
//! eigenvector (found by power iteration) gives the axis a poorly-fit lobe
//! is split along.

use ordered_float::OrderedFloat;

use crate::lobe::{self, VmfLobe};
use crate::mixture::{Mixture, K_MAX};
use crate::sample::DirectionalSample;
use crate::suffstats::SufficientStatistics;
use crate::tracing_sink::{TraceEvent, TracingSink};

const EPSILON: f64 = 1.0e-12;
const POWER_ITERATIONS: usize = 24;

/// Weighted angular-covariance accumulator for one component. Plain stack
/// array rather than a heap-backed matrix type: this is touched once per
/// sample per component on the steady-state update path, which must not
/// allocate.
#[derive(Debug, Clone, Copy)]
struct Covariance3 {
    m: [[f64; 3]; 3],
}

impl Covariance3 {
    fn zero() -> Self {
        Covariance3 { m: [[0.0; 3]; 3] }
    }

    fn add_outer(&mut self, v: [f64; 3], weight: f64) {
        for i in 0..3 {
            for j in 0..3 {
                self.m[i][j] += weight * v[i] * v[j];
            }
        }
    }

    fn mat_vec(&self, v: [f64; 3]) -> [f64; 3] {
        let mut out = [0.0; 3];
        for i in 0..3 {
            out[i] = self.m[i][0] * v[0] + self.m[i][1] * v[1] + self.m[i][2] * v[2];
        }
        out
    }

    /// Dominant eigenvector by power iteration, seeded off-axis from `seed`
    /// so a near-isotropic matrix still converges to *some* direction.
    fn principal_axis(&self, seed: [f64; 3]) -> [f64; 3] {
        let mut v = lobe::normalize(if lobe::norm(seed) > 0.0 {
            seed
        } else {
            [1.0, 0.0, 0.0]
        });
        for _ in 0..POWER_ITERATIONS {
            let next = self.mat_vec(v);
            let n = lobe::norm(next);
            if n < EPSILON {
                break;
            }
            v = lobe::scale(next, 1.0 / n);
        }
        v
    }
}

/// Per-component split diagnostics: the chi-squared accumulator
/// `s_k`, the angular-covariance accumulator, the count of samples that
/// contributed, and a monotone since-last-split counter.
#[derive(Debug, Clone)]
pub struct SplitStatistics {
    k: usize,
    chi_squared: [f64; K_MAX],
    covariance: [Covariance3; K_MAX],
    sample_count: [u64; K_MAX],
    since_last_split: [u64; K_MAX],
}

impl SplitStatistics {
    pub fn new(k: usize) -> Self {
        SplitStatistics {
            k,
            chi_squared: [0.0; K_MAX],
            covariance: [Covariance3::zero(); K_MAX],
            sample_count: [0; K_MAX],
            since_last_split: [0; K_MAX],
        }
    }

    pub fn num_components(&self) -> usize {
        self.k
    }

    pub fn chi_squared(&self, k: usize) -> f64 {
        self.chi_squared[k]
    }

    pub fn since_last_split(&self, k: usize) -> u64 {
        self.since_last_split[k]
    }

    pub fn set_num_components(&mut self, k_new: usize) {
        assert!(k_new >= 1 && k_new <= K_MAX);
        if k_new > self.k {
            for k in self.k..k_new {
                self.zero_component(k);
            }
        }
        self.k = k_new;
    }

    pub(crate) fn zero_component(&mut self, k: usize) {
        self.chi_squared[k] = 0.0;
        self.covariance[k] = Covariance3::zero();
        self.sample_count[k] = 0;
        self.since_last_split[k] = 0;
    }

    pub(crate) fn move_component(&mut self, src: usize, dst: usize) {
        self.chi_squared[dst] = self.chi_squared[src];
        self.covariance[dst] = self.covariance[src];
        self.sample_count[dst] = self.sample_count[src];
        self.since_last_split[dst] = self.since_last_split[src];
        self.zero_component(src);
    }

    pub(crate) fn bump_since_last_split(&mut self, n: u64) {
        for k in 0..self.k {
            self.since_last_split[k] += n;
        }
    }

    pub(crate) fn reset_since_last_split(&mut self) {
        for k in 0..self.k {
            self.since_last_split[k] = 0;
        }
    }

    pub fn is_valid(&self) -> bool {
        if self.k == 0 || self.k > K_MAX {
            return false;
        }
        self.chi_squared[..self.k].iter().all(|v| v.is_finite())
    }
}

/// A proposed split: component index and its chi-squared score.
#[derive(Debug, Clone, Copy)]
pub struct SplitCandidate {
    pub component: usize,
    pub score: f64,
}

/// Recomputes `stats` from scratch against `mix` and `samples`: the
/// chi-squared discrepancy between each sample's empirical weight and the
/// mass component `k` alone predicts for it, normalised by the batch's
/// Monte-Carlo estimate.
pub fn calculate_split_statistics(mix: &Mixture, samples: &[DirectionalSample], stats: &mut SplitStatistics) -> f64 {
    let k = mix.num_components();
    *stats = SplitStatistics::new(k);

    let mut mc_sum = 0.0f64;
    let mut mc_n = 0u64;
    for s in samples {
        if !s.is_valid() {
            continue;
        }
        mc_sum += s.directional_weight() as f64;
        mc_n += 1;
    }
    if mc_n == 0 {
        return 0.0;
    }
    let mc_estimate = mc_sum / mc_n as f64;

    accumulate_split_statistics(mix, samples, stats, mc_estimate);
    mc_estimate
}

/// Online accumulation variant: adds
/// into the existing `stats` rather than resetting, using the batch's own
/// Monte-Carlo estimate.
pub fn update_split_statistics(mix: &Mixture, samples: &[DirectionalSample], stats: &mut SplitStatistics) -> f64 {
    let mut mc_sum = 0.0f64;
    let mut mc_n = 0u64;
    for s in samples {
        if !s.is_valid() {
            continue;
        }
        mc_sum += s.directional_weight() as f64;
        mc_n += 1;
    }
    if mc_n == 0 {
        return 0.0;
    }
    let mc_estimate = mc_sum / mc_n as f64;
    accumulate_split_statistics(mix, samples, stats, mc_estimate);
    stats.bump_since_last_split(mc_n);
    mc_estimate
}

fn accumulate_split_statistics(
    mix: &Mixture,
    samples: &[DirectionalSample],
    stats: &mut SplitStatistics,
    mc_estimate: f64,
) {
    let k = mix.num_components();

    // First pass: the batch-level accumulated mass a_k = Sum_i w_hat_i *
    // gamma_ik, via the same responsibility accumulator the EM factory uses
    // (see em.rs's e_step/m_step), not a per-sample stand-in.
    let mut mass = SufficientStatistics::new(k);
    for s in samples {
        if !s.is_valid() {
            continue;
        }
        let omega = lobe::normalize([s.direction[0] as f64, s.direction[1] as f64, s.direction[2] as f64]);
        let w_hat = s.directional_weight() as f64;
        let component_pdfs = mix.component_pdfs(omega);
        let p: f64 = (0..k).map(|kk| mix.weight(kk) * component_pdfs[kk]).sum();
        if p <= 0.0 || !p.is_finite() {
            continue;
        }
        for kk in 0..k {
            let gamma = mix.weight(kk) * component_pdfs[kk] / p;
            if gamma <= 0.0 {
                continue;
            }
            mass.accumulate(kk, w_hat * gamma, [0.0; 3], 0.0);
        }
    }

    // Second pass: S_k = Sum_i gamma_ik * (w_hat_i - a_k * f_k(omega_i) /
    // p(omega_i))^2 / (a_k * f_k(omega_i) / p(omega_i) + eps).
    for s in samples {
        if !s.is_valid() {
            continue;
        }
        let omega = lobe::normalize([s.direction[0] as f64, s.direction[1] as f64, s.direction[2] as f64]);
        let w_hat = s.directional_weight() as f64;
        let component_pdfs = mix.component_pdfs(omega);
        let p: f64 = (0..k).map(|kk| mix.weight(kk) * component_pdfs[kk]).sum();
        if p <= 0.0 || !p.is_finite() {
            continue;
        }
        for kk in 0..k {
            let gamma = mix.weight(kk) * component_pdfs[kk] / p;
            if gamma <= 0.0 {
                continue;
            }
            let a_k = mass.sum_gamma(kk);
            let f_k = component_pdfs[kk];
            let predicted = a_k * f_k / p.max(EPSILON);
            let diff = w_hat - predicted;
            let denom = (predicted + EPSILON).max(EPSILON);
            stats.chi_squared[kk] += gamma * (diff * diff) / denom;
            stats.covariance[kk].add_outer(omega, gamma * w_hat);
            stats.sample_count[kk] += 1;
        }
    }

    if mc_estimate > 0.0 {
        for kk in 0..k {
            let a_k = mass.sum_gamma(kk);
            if a_k > EPSILON {
                stats.chi_squared[kk] /= mc_estimate * a_k;
            }
        }
    }
}

/// Ranks components whose chi-squared score exceeds `threshold`, most
/// extreme first.
pub fn split_candidates(stats: &SplitStatistics, threshold: f64) -> Vec<SplitCandidate> {
    let mut out: Vec<SplitCandidate> = (0..stats.num_components())
        .filter(|&k| stats.chi_squared[k] > threshold)
        .map(|k| SplitCandidate {
            component: k,
            score: stats.chi_squared[k],
        })
        .collect();
    out.sort_by_key(|c| std::cmp::Reverse(OrderedFloat(c.score)));
    out
}

/// Splits component `k` into two children at the end of the mixture: the
/// parent's lobe is replaced in place, the child is appended at the current
/// component count. Both `mix` and `stats` grow by one; refuses (returns
/// `false`, no mutation) if the mixture is already at `K_MAX`.
pub fn split_component(mix: &mut Mixture, stats: &mut SplitStatistics, k: usize) -> bool {
    let old_k = mix.num_components();
    if old_k >= K_MAX {
        return false;
    }
    let new_k = old_k;

    let parent_lobe = mix.lobe(k);
    let parent_weight = mix.weight(k);
    let parent_distance = mix.pivot_distance(k);
    let axis = stats.covariance[k].principal_axis(parent_lobe.mu);

    // An axis orthogonal to mu to rotate mu around: project axis onto the
    // plane perpendicular to mu, or fall back to any orthogonal vector if
    // the covariance was degenerate (isotropic / too few samples).
    let axis_perp = {
        let proj = lobe::sub(axis, lobe::scale(parent_lobe.mu, lobe::dot(axis, parent_lobe.mu)));
        if lobe::norm(proj) > 1.0e-8 {
            lobe::normalize(proj)
        } else {
            let up = if parent_lobe.mu[2].abs() < 0.9 {
                [0.0, 0.0, 1.0]
            } else {
                [1.0, 0.0, 0.0]
            };
            lobe::normalize(lobe::cross(up, parent_lobe.mu))
        }
    };

    let r_k = lobe::mean_cosine(parent_lobe.kappa).clamp(0.0, 1.0 - 1.0e-6);
    let cos_theta = r_k.sqrt().clamp(0.0, 1.0);
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();

    let mu_plus = lobe::normalize(lobe::add(
        lobe::scale(parent_lobe.mu, cos_theta),
        lobe::scale(axis_perp, sin_theta),
    ));
    let mu_minus = lobe::normalize(lobe::sub(
        lobe::scale(parent_lobe.mu, cos_theta),
        lobe::scale(axis_perp, sin_theta),
    ));

    // Halved spread: double the concentration's mean-cosine deficit is
    // roughly preserved by doubling kappa, clamped to the valid range.
    let child_kappa = (parent_lobe.kappa * 2.0).clamp(0.0, lobe::KAPPA_MAX);
    let child_weight = parent_weight / 2.0;

    mix.set_component(k, child_weight, VmfLobe::new(mu_plus, child_kappa), parent_distance);
    mix.set_num_components(new_k + 1);
    mix.set_component(
        new_k,
        child_weight,
        VmfLobe::new(mu_minus, child_kappa),
        parent_distance,
    );

    stats.set_num_components(new_k + 1);
    stats.zero_component(k);
    stats.zero_component(new_k);
    true
}

/// Cold-start recursive splitting:
/// at most `max_iterations` passes, stopping early the first time a full
/// pass over the current split statistics produces zero splits.
pub fn perform_recursive_splitting(
    mix: &mut Mixture,
    stats: &mut SplitStatistics,
    samples: &[DirectionalSample],
    threshold: f64,
    max_iterations: usize,
    sink: &mut dyn TracingSink,
) -> usize {
    let mut total_splits = 0usize;
    for _ in 0..max_iterations {
        let mc_estimate = calculate_split_statistics(mix, samples, stats);
        sink.emit(TraceEvent::McEstimate(mc_estimate));
        let candidates = split_candidates(stats, threshold);
        if candidates.is_empty() {
            break;
        }
        let mut splits_this_pass = 0usize;
        for candidate in candidates {
            if mix.num_components() >= K_MAX {
                sink.emit(TraceEvent::SplitRefused {
                    component: candidate.component,
                });
                break;
            }
            let parent = candidate.component;
            if split_component(mix, stats, parent) {
                let child = mix.num_components() - 1;
                sink.emit(TraceEvent::SplitPerformed { parent, child });
                splits_this_pass += 1;
            } else {
                sink.emit(TraceEvent::SplitRefused { component: parent });
            }
        }
        total_splits += splits_this_pass;
        if splits_this_pass == 0 {
            break;
        }
    }
    total_splits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobe::VmfLobe;
    use crate::sample::SampleFlags;
    use rand::{Rng, SeedableRng};

    fn draw_batch(mu: [f64; 3], kappa: f64, n: usize, seed: u64) -> Vec<DirectionalSample> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let u1: f64 = rng.gen();
                let u2: f64 = rng.gen();
                let dir = lobe::sample(mu, kappa, u1, u2);
                DirectionalSample::new(
                    [0.0, 0.0, 0.0],
                    [dir[0] as f32, dir[1] as f32, dir[2] as f32],
                    1.0,
                    1.0,
                    1.0,
                    SampleFlags::default(),
                )
            })
            .collect()
    }

    #[test]
    fn two_well_separated_modes_score_above_threshold_for_single_lobe() {
        let mut samples = draw_batch([1.0, 0.0, 0.0], 40.0, 2000, 11);
        samples.extend(draw_batch([-1.0, 0.0, 0.0], 40.0, 2000, 12));
        let mix = Mixture::from_components(&[1.0], &[VmfLobe::new([0.0, 1.0, 0.0], 1.0)], &[1.0], [0.0; 3]);
        let mut stats = SplitStatistics::new(1);
        calculate_split_statistics(&mix, &samples, &mut stats);
        assert!(stats.chi_squared(0) > 0.75);
    }

    #[test]
    fn split_score_is_consistently_elevated_across_independent_batches() {
        use statrs::statistics::Statistics;
        let mix = Mixture::from_components(&[1.0], &[VmfLobe::new([0.0, 1.0, 0.0], 1.0)], &[1.0], [0.0; 3]);
        let scores: Vec<f64> = (0..5)
            .map(|trial| {
                let mut samples = draw_batch([1.0, 0.0, 0.0], 40.0, 1000, 50 + trial);
                samples.extend(draw_batch([-1.0, 0.0, 0.0], 40.0, 1000, 150 + trial));
                let mut stats = SplitStatistics::new(1);
                calculate_split_statistics(&mix, &samples, &mut stats);
                stats.chi_squared(0)
            })
            .collect();
        let mean = scores.clone().mean();
        let std_dev = scores.std_dev();
        assert!(mean > 0.75);
        assert!(std_dev < mean);
    }

    #[test]
    fn split_component_grows_mixture_and_preserves_weight() {
        let mut mix = Mixture::from_components(&[1.0], &[VmfLobe::new([0.0, 0.0, 1.0], 10.0)], &[2.0], [0.0; 3]);
        let mut stats = SplitStatistics::new(1);
        let samples = draw_batch([0.0, 0.0, 1.0], 10.0, 500, 13);
        calculate_split_statistics(&mix, &samples, &mut stats);
        let ok = split_component(&mut mix, &mut stats, 0);
        assert!(ok);
        assert_eq!(mix.num_components(), 2);
        assert!((mix.weight(0) + mix.weight(1) - 1.0).abs() < 1e-9);
        assert_eq!(stats.num_components(), 2);
    }

    #[test]
    fn split_refused_at_capacity() {
        let weights = vec![1.0 / K_MAX as f64; K_MAX];
        let lobes: Vec<VmfLobe> = (0..K_MAX).map(|_| VmfLobe::new([0.0, 0.0, 1.0], 10.0)).collect();
        let distances = vec![1.0; K_MAX];
        let mut mix = Mixture::from_components(&weights, &lobes, &distances, [0.0; 3]);
        let mut stats = SplitStatistics::new(K_MAX);
        assert!(!split_component(&mut mix, &mut stats, 0));
        assert_eq!(mix.num_components(), K_MAX);
    }

    #[test]
    fn recursive_splitting_stops_when_a_pass_yields_nothing() {
        let mut mix = Mixture::from_components(&[1.0], &[VmfLobe::new([1.0, 0.0, 0.0], 40.0)], &[1.0], [0.0; 3]);
        let mut stats = SplitStatistics::new(1);
        let mut samples = draw_batch([1.0, 0.0, 0.0], 40.0, 1500, 21);
        samples.extend(draw_batch([-1.0, 0.0, 0.0], 40.0, 1500, 22));
        let mut sink = crate::tracing_sink::NullTracingSink;
        let splits = perform_recursive_splitting(&mut mix, &mut stats, &samples, 0.75, 5, &mut sink);
        assert!(splits >= 1);
        assert!(mix.num_components() <= K_MAX);
    }
}
