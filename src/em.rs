//! Weighted EM factory: one-shot fit and incremental/partial update of a
//! `Mixture` from a sample batch.

use crate::error::{GuideError, Result};
use crate::lobe::{self, VmfLobe};
use crate::mixture::{Mixture, K_MAX};
use crate::sample::DirectionalSample;
use crate::suffstats::SufficientStatistics;

/// Responsibility mass below this is treated as a dead component: weight
/// zeroed, left for the next split/merge pass to compact out.
const MIN_RESPONSIBILITY_MASS: f64 = 1.0e-8;

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct WeightedEmConfig {
    pub max_iterations: usize,
    pub threshold: f64,
}

impl Default for WeightedEmConfig {
    fn default() -> Self {
        WeightedEmConfig {
            max_iterations: 100,
            threshold: 1.0e-5,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EmFittingStatistics {
    pub num_iterations: usize,
    pub num_invalid_samples: usize,
}

/// A fixed-size bitmask over mixture components, used by `partial_update_mixture`
/// to freeze everything outside the touched set.
#[derive(Debug, Clone, Copy)]
pub struct PartialFittingMask {
    bits: [bool; K_MAX],
}

impl PartialFittingMask {
    pub fn reset_to_false() -> Self {
        PartialFittingMask { bits: [false; K_MAX] }
    }

    pub fn set_to_true(&mut self, k: usize) {
        self.bits[k] = true;
    }

    pub fn get(&self, k: usize) -> bool {
        self.bits[k]
    }

    pub fn as_slice(&self, k: usize) -> &[bool] {
        &self.bits[..k]
    }
}

/// Low-discrepancy-ish seeding of `k` directions on S^2 via the golden-angle
/// spiral (a standard stand-in for a precomputed Fibonacci-sphere table),
/// used to initialise a cold-start mixture.
fn golden_spiral_directions(k: usize) -> Vec<[f64; 3]> {
    use std::f64::consts::PI;
    let golden_angle = PI * (3.0 - 5.0f64.sqrt());
    (0..k)
        .map(|i| {
            let t = (i as f64 + 0.5) / k as f64;
            let z = 1.0 - 2.0 * t;
            let radius = (1.0 - z * z).max(0.0).sqrt();
            let theta = golden_angle * i as f64;
            [radius * theta.cos(), radius * theta.sin(), z]
        })
        .collect()
}

fn centroid(samples: &[DirectionalSample]) -> [f64; 3] {
    if samples.is_empty() {
        return [0.0, 0.0, 0.0];
    }
    let mut c = [0.0; 3];
    for s in samples {
        for i in 0..3 {
            c[i] += s.position[i] as f64;
        }
    }
    let n = samples.len() as f64;
    [c[0] / n, c[1] / n, c[2] / n]
}

/// E-step over the whole batch: computes responsibility-weighted sums per
/// component plus the batch log-likelihood, against the *current* mixture
/// parameters. Returns `(local_accum, log_likelihood, num_invalid)`.
fn e_step(
    mix: &Mixture,
    samples: &[DirectionalSample],
    mask: Option<&[bool]>,
) -> (SufficientStatistics, f64, usize) {
    let k = mix.num_components();
    let mut local = SufficientStatistics::new(k);
    let mut log_likelihood = 0.0f64;
    let mut num_invalid = 0usize;

    for s in samples {
        if !s.is_valid() {
            num_invalid += 1;
            continue;
        }
        let omega = [s.direction[0] as f64, s.direction[1] as f64, s.direction[2] as f64];
        let omega = lobe::normalize(omega);
        let component_pdfs = mix.component_pdfs(omega);
        let p: f64 = (0..k).map(|kk| mix.weight(kk) * component_pdfs[kk]).sum();
        if p <= 0.0 || !p.is_finite() {
            // No component explains this sample; skip it rather than
            // poisoning the batch log-likelihood.
            num_invalid += 1;
            continue;
        }
        let w_hat = s.directional_weight() as f64;
        log_likelihood += w_hat * p.ln();

        for kk in 0..k {
            // Responsibilities are tallied for every component regardless
            // of mask; frozen components still track the batch's weight,
            // the M-step is what decides whether to touch their orientation.
            let gamma = mix.weight(kk) * component_pdfs[kk] / p;
            let contribution = w_hat * gamma;
            local.accumulate(
                kk,
                contribution,
                lobe::scale(omega, contribution),
                contribution / s.distance as f64,
            );
        }
        local.accumulate_totals(w_hat);
    }
    local.add_samples(samples.len() as u64);
    (local, log_likelihood, num_invalid)
}

/// M-step: reads `total` (prior + this batch) back into the mixture's
/// weights, and into `mu`/`kappa` for every component where `mask` allows
/// it.
fn m_step(mix: &mut Mixture, total: &SufficientStatistics, mask: Option<&[bool]>) -> Result<()> {
    let k = mix.num_components();
    let mut new_weight = vec![0.0; k];
    for kk in 0..k {
        let a_k = total.sum_gamma(kk);
        new_weight[kk] = a_k;

        let active = mask.map(|m| m[kk]).unwrap_or(true);
        if !active {
            continue;
        }

        if a_k < MIN_RESPONSIBILITY_MASS {
            // Dead component. Zero its weight and leave orientation as-is;
            // the next split/merge pass compacts it out.
            new_weight[kk] = 0.0;
            continue;
        }

        let v_k = total.sum_gamma_omega(kk);
        let v_norm = lobe::norm(v_k);
        let r_k = (v_norm / a_k).clamp(0.0, 1.0);
        let mu = if v_norm > 0.0 {
            lobe::normalize(v_k)
        } else {
            mix.lobe(kk).mu
        };
        let kappa = lobe::kappa_from_mean_cosine(r_k.min(1.0 - 1.0e-6));
        if !mu.iter().all(|v| v.is_finite()) || !kappa.is_finite() {
            return Err(GuideError::NumericDegeneracy {
                reason: "non-finite lobe parameters in M-step",
            });
        }

        let pivot_distance = if total.sum_gamma_inv_distance(kk) > 0.0 {
            a_k / total.sum_gamma_inv_distance(kk)
        } else {
            mix.pivot_distance(kk)
        };
        if !pivot_distance.is_finite() || pivot_distance <= 0.0 {
            return Err(GuideError::NumericDegeneracy {
                reason: "non-finite or non-positive pivot distance in M-step",
            });
        }

        mix.set_component(kk, new_weight[kk], VmfLobe::new(mu, kappa), pivot_distance);
    }
    for kk in 0..k {
        if mask.map(|m| !m[kk]).unwrap_or(false) {
            // Frozen: weight still tracks the new responsibility mass so
            // renormalisation redistributes correctly, orientation is
            // whatever it already was.
            mix.set_component(kk, new_weight[kk], mix.lobe(kk), mix.pivot_distance(kk));
        }
    }

    if new_weight.iter().all(|&w| w < MIN_RESPONSIBILITY_MASS) {
        return Err(GuideError::NumericDegeneracy {
            reason: "all components degenerate: a_k below epsilon for every k",
        });
    }
    mix.renormalize_weights();
    Ok(())
}

/// Runs weighted EM to convergence (or `cfg.max_iterations`), against a
/// frozen `prior` that is never mutated mid-loop; at the end returns the
/// final iteration's batch-local accumulation, which the caller commits
/// into the persistent sufficient statistics exactly once, so the prior's
/// sums are preserved across every intermediate iteration.
fn run_em(
    mix: &mut Mixture,
    prior: &SufficientStatistics,
    samples: &[DirectionalSample],
    cfg: &WeightedEmConfig,
    mask: Option<&[bool]>,
) -> Result<(SufficientStatistics, EmFittingStatistics)> {
    let snapshot = mix.clone();
    let mut prev_ll = f64::NEG_INFINITY;
    let mut fit_stats = EmFittingStatistics::default();
    let mut last_local = SufficientStatistics::new(mix.num_components());

    for iter in 0..cfg.max_iterations.max(1) {
        let (local, log_likelihood, num_invalid) = e_step(mix, samples, mask);
        fit_stats.num_invalid_samples = num_invalid;
        if !log_likelihood.is_finite() {
            *mix = snapshot;
            return Err(GuideError::NumericDegeneracy {
                reason: "non-finite log-likelihood during E-step",
            });
        }

        let mut total = prior.clone();
        total.merge_add(&local);

        if let Err(e) = m_step(mix, &total, mask) {
            *mix = snapshot;
            return Err(e);
        }
        if !mix.is_valid() {
            *mix = snapshot;
            return Err(GuideError::NumericDegeneracy {
                reason: "mixture failed validity check after M-step",
            });
        }

        last_local = local;
        fit_stats.num_iterations = iter + 1;

        let denom = log_likelihood.abs().max(1.0e-12);
        let rel_change = (log_likelihood - prev_ll).abs() / denom;
        if iter > 0 && rel_change < cfg.threshold {
            prev_ll = log_likelihood;
            break;
        }
        prev_ll = log_likelihood;
    }
    let _ = prev_ll;
    Ok((last_local, fit_stats))
}

/// Cold-start fit: seeds a `k`-component mixture
/// from a low-discrepancy direction table, kappa = 5.0, uniform weights,
/// and a pivot at the sample centroid, then runs EM to convergence.
pub fn fit_mixture(
    k: usize,
    samples: &[DirectionalSample],
    cfg: &WeightedEmConfig,
) -> Result<(Mixture, SufficientStatistics, EmFittingStatistics)> {
    assert!(k >= 1 && k <= K_MAX);
    let directions = golden_spiral_directions(k);
    let pivot = centroid(samples);
    let weights: Vec<f64> = vec![1.0 / k as f64; k];
    let lobes: Vec<VmfLobe> = directions.iter().map(|&d| VmfLobe::new(d, 5.0)).collect();
    let pivot_distances: Vec<f64> = vec![1.0; k];
    let mut mix = Mixture::from_components(&weights, &lobes, &pivot_distances, pivot);

    let zero_prior = SufficientStatistics::new(k);
    let (final_local, fit_stats) = run_em(&mut mix, &zero_prior, samples, cfg, None)?;

    let mut suff = SufficientStatistics::new(k);
    suff.merge_add(&final_local);
    suff.add_batch();

    Ok((mix, suff, fit_stats))
}

/// Warm update: continues EM from the current
/// mixture and the running sufficient statistics; `suff` is not reset, and
/// is advanced in place by this batch's contribution.
pub fn update_mixture(
    mix: &mut Mixture,
    suff: &mut SufficientStatistics,
    samples: &[DirectionalSample],
    cfg: &WeightedEmConfig,
) -> Result<EmFittingStatistics> {
    let prior = suff.clone();
    let (final_local, fit_stats) = run_em(mix, &prior, samples, cfg, None)?;
    suff.merge_add(&final_local);
    suff.add_batch();
    Ok(fit_stats)
}

/// Partial (masked) refit: EM runs only
/// over components where `mask` is true; the rest are frozen in
/// orientation (their weight still updates). Used after a split so the two
/// child lobes can re-fit without disturbing unrelated lobes. `temp_suff`
/// is scratch, scoped to this call and
/// mirrors the mixture's current component count on entry.
pub fn partial_update_mixture(
    mix: &mut Mixture,
    mask: &PartialFittingMask,
    temp_suff: &mut SufficientStatistics,
    samples: &[DirectionalSample],
    cfg: &WeightedEmConfig,
) -> Result<EmFittingStatistics> {
    let k = mix.num_components();
    let mask_slice = mask.as_slice(k).to_vec();
    let prior = temp_suff.clone();
    let (final_local, fit_stats) = run_em(mix, &prior, samples, cfg, Some(&mask_slice))?;
    temp_suff.merge_add(&final_local);
    temp_suff.add_batch();
    Ok(fit_stats)
}

/// Computes per-component pivot distances as the responsibility-weighted
/// harmonic mean of sample distance, used by the orchestrator
/// to (re)initialise distances outside the main EM loop (e.g. right after
/// a cold-start fit, before any split/merge touches the mixture).
pub fn init_component_distances(
    mix: &mut Mixture,
    samples: &[DirectionalSample],
) {
    let k = mix.num_components();
    let mut sum_gamma = vec![0.0f64; k];
    let mut sum_inv_distance = vec![0.0f64; k];
    for s in samples {
        if !s.is_valid() {
            continue;
        }
        let omega = lobe::normalize([s.direction[0] as f64, s.direction[1] as f64, s.direction[2] as f64]);
        let component_pdfs = mix.component_pdfs(omega);
        let p: f64 = (0..k).map(|kk| mix.weight(kk) * component_pdfs[kk]).sum();
        if p <= 0.0 || !p.is_finite() {
            continue;
        }
        let w_hat = s.directional_weight() as f64;
        for kk in 0..k {
            let gamma = mix.weight(kk) * component_pdfs[kk] / p;
            let contribution = w_hat * gamma;
            sum_gamma[kk] += contribution;
            sum_inv_distance[kk] += contribution / s.distance as f64;
        }
    }
    for kk in 0..k {
        if sum_inv_distance[kk] > 0.0 && sum_gamma[kk] > 0.0 {
            let d = sum_gamma[kk] / sum_inv_distance[kk];
            if d.is_finite() && d > 0.0 {
                mix.set_component(kk, mix.weight(kk), mix.lobe(kk), d);
            }
        }
    }
}
