//! Fixed-capacity mixture of weighted vMF lobes with a parallax pivot.

use crate::lobe::{self, VmfLobe};

/// Fixed compile-time bound on mixture size. A single contiguous array
/// backs the mixture so the steady-state update path never allocates.
pub const K_MAX: usize = 32;

/// Cosine-lobe "pseudo-light" direction weight used in the analytic cosine
/// product: `mu' = normalize(kappa*mu + 2.18*n)`. The constant
/// approximates the concentration of a clamped-cosine lobe.
const COSINE_LOBE_WEIGHT: f64 = 2.18;

#[derive(Debug, Clone)]
pub struct Mixture {
    k: usize,
    weights: [f64; K_MAX],
    lobes: [VmfLobe; K_MAX],
    pivot_distances: [f64; K_MAX],
    pivot_position: [f64; 3],
}

impl Mixture {
    /// A uniform single-lobe mixture pointed along +z, as used by `clear()`.
    pub fn uniform(pivot_position: [f64; 3]) -> Self {
        Mixture {
            k: 1,
            weights: {
                let mut w = [0.0; K_MAX];
                w[0] = 1.0;
                w
            },
            lobes: [VmfLobe::new([0.0, 0.0, 1.0], 0.0); K_MAX],
            pivot_distances: [1.0; K_MAX],
            pivot_position,
        }
    }

    /// Builds a mixture from explicit per-component state. `weights` must
    /// sum to ~1 and `k` must be within `[1, K_MAX]`; callers (the EM
    /// factory) are responsible for that invariant.
    pub fn from_components(
        weights: &[f64],
        lobes: &[VmfLobe],
        pivot_distances: &[f64],
        pivot_position: [f64; 3],
    ) -> Self {
        assert!(weights.len() == lobes.len() && lobes.len() == pivot_distances.len());
        assert!(weights.len() <= K_MAX && !weights.is_empty());
        let k = weights.len();
        let mut w = [0.0; K_MAX];
        let mut l = [VmfLobe::new([0.0, 0.0, 1.0], 0.0); K_MAX];
        let mut d = [1.0; K_MAX];
        for i in 0..k {
            w[i] = weights[i];
            l[i] = lobes[i];
            d[i] = pivot_distances[i];
        }
        Mixture {
            k,
            weights: w,
            lobes: l,
            pivot_distances: d,
            pivot_position,
        }
    }

    pub fn num_components(&self) -> usize {
        self.k
    }

    pub fn weight(&self, k: usize) -> f64 {
        self.weights[k]
    }

    pub fn lobe(&self, k: usize) -> VmfLobe {
        self.lobes[k]
    }

    pub fn pivot_distance(&self, k: usize) -> f64 {
        self.pivot_distances[k]
    }

    pub fn pivot_position(&self) -> [f64; 3] {
        self.pivot_position
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights[..self.k]
    }

    pub fn lobes(&self) -> &[VmfLobe] {
        &self.lobes[..self.k]
    }

    pub fn pivot_distances(&self) -> &[f64] {
        &self.pivot_distances[..self.k]
    }

    pub(crate) fn set_component(&mut self, k: usize, weight: f64, lobe: VmfLobe, pivot_distance: f64) {
        self.weights[k] = weight;
        self.lobes[k] = lobe;
        self.pivot_distances[k] = pivot_distance;
    }

    pub(crate) fn set_num_components(&mut self, k: usize) {
        assert!(k >= 1 && k <= K_MAX);
        self.k = k;
    }

    pub(crate) fn set_pivot_position(&mut self, pos: [f64; 3]) {
        self.pivot_position = pos;
    }

    /// Renormalises weights to sum to exactly 1.
    pub(crate) fn renormalize_weights(&mut self) {
        let sum: f64 = self.weights[..self.k].iter().sum();
        if sum > 0.0 {
            for w in self.weights[..self.k].iter_mut() {
                *w /= sum;
            }
        } else {
            let uniform = 1.0 / self.k as f64;
            for w in self.weights[..self.k].iter_mut() {
                *w = uniform;
            }
        }
    }

    /// `pdf(omega) = sum_k w_k * f(omega; mu_k, kappa_k)`.
    pub fn pdf(&self, omega: [f64; 3]) -> f64 {
        let mut p = 0.0;
        for k in 0..self.k {
            p += self.weights[k] * self.lobes[k].eval(omega);
        }
        p
    }

    /// Per-component mixing-weighted densities, used by the E-step and by
    /// the split statistics.
    pub fn component_pdfs(&self, omega: [f64; 3]) -> [f64; K_MAX] {
        let mut out = [0.0; K_MAX];
        for k in 0..self.k {
            out[k] = self.lobes[k].eval(omega);
        }
        out
    }

    /// Discrete CDF-inverse component selection followed by a lobe sample.
    /// Returns `(direction, pdf_at_direction)`. `u1` selects the component
    /// via the weight CDF; the remainder after selection rescales `u1` so a
    /// caller reusing it downstream still sees a uniform variate.
    pub fn sample(&self, u1: f64, u2: f64) -> ([f64; 3], f64) {
        let (component, _rescaled_u1) = self.select_component(u1);
        let omega = self.lobes[component].sample(_rescaled_u1, u2);
        let pdf = self.pdf(omega);
        (omega, pdf)
    }

    /// Combined sample+pdf entry point; identical cost
    /// to `sample` here since the mixture has no cheaper joint form, but
    /// kept distinct to match the external contract.
    pub fn sample_pdf(&self, u1: f64, u2: f64) -> ([f64; 3], f64) {
        self.sample(u1, u2)
    }

    fn select_component(&self, u1: f64) -> (usize, f64) {
        // Cumulative weights; `bisection::bisect_right` finds the first CDF
        // bucket whose upper edge exceeds u1.
        let mut cdf = [0.0f64; K_MAX];
        let mut acc = 0.0;
        for k in 0..self.k {
            acc += self.weights[k];
            cdf[k] = acc;
        }
        let idx = bisection::bisect_right(&cdf[..self.k], &u1).min(self.k - 1);
        let lower = if idx == 0 { 0.0 } else { cdf[idx - 1] };
        let span = (cdf[idx] - lower).max(1.0e-12);
        let rescaled = ((u1 - lower) / span).clamp(0.0, 1.0 - 1.0e-12);
        (idx, rescaled)
    }

    /// Applies parallax compensation: each `mu_k` is rotated to point from
    /// the query position `q` toward the virtual source implied by the
    /// pivot `p` and the per-component distance `d_k`. Weights
    /// and concentrations are unchanged. Returns a new mixture (the
    /// original, pivot-relative mixture is the persistent one owned by the
    /// orchestrator).
    pub fn with_parallax_compensation(&self, query_position: [f64; 3]) -> Mixture {
        if query_position == self.pivot_position {
            return self.clone();
        }
        let mut out = self.clone();
        for k in 0..self.k {
            let virtual_source = lobe::add(
                self.pivot_position,
                lobe::scale(self.lobes[k].mu, self.pivot_distances[k]),
            );
            let dir = lobe::sub(virtual_source, query_position);
            out.lobes[k] = VmfLobe::new(lobe::normalize(dir), self.lobes[k].kappa);
        }
        out.pivot_position = query_position;
        out
    }

    /// Whether the analytic cosine product is supported for this kernel;
    /// vMF supports it.
    pub fn supports_apply_cosine_product(&self) -> bool {
        true
    }

    /// Replaces each `(w_k, mu_k, kappa_k)` with the normalised product of
    /// the lobe and the clamped-cosine lobe at `n`.
    pub fn apply_cosine_product(&mut self, n: [f64; 3]) {
        let n = lobe::normalize(n);
        let mut new_weight = [0.0; K_MAX];
        for k in 0..self.k {
            let lobe_k = self.lobes[k];
            let cos_term = lobe::dot(lobe_k.mu, n).max(0.0);

            // Two vMF exponents sum under a product, so the combined shape
            // is itself (unnormalized) vMF with mu' = normalize(k*mu + c*n)
            // and kappa' = ||k*mu + c*n|| -- exact for the exponential-form
            // product, which is what "mean-cosine of the mixture-of-lobe
            // analytic form matches" reduces to here.
            let combined = lobe::add(lobe::scale(lobe_k.mu, lobe_k.kappa), lobe::scale(n, COSINE_LOBE_WEIGHT));
            let r = lobe::norm(combined);
            let mu_prime = if r > 0.0 {
                lobe::scale(combined, 1.0 / r)
            } else {
                lobe_k.mu
            };
            let kappa_prime = r.clamp(0.0, lobe::KAPPA_MAX);

            self.lobes[k] = VmfLobe::new(mu_prime, kappa_prime);
            new_weight[k] = self.weights[k] * cos_term;
        }
        self.weights = new_weight;
        self.renormalize_weights();
    }

    /// Structural validity: component count in range, weights nonnegative
    /// and summing to ~1, every lobe and pivot distance finite (the
    /// cross-type component-count match is the caller's job since
    /// sufficient/split statistics live outside this type).
    pub fn is_valid(&self) -> bool {
        if self.k == 0 || self.k > K_MAX {
            return false;
        }
        let sum: f64 = self.weights[..self.k].iter().sum();
        if (sum - 1.0).abs() >= 1.0e-5 {
            return false;
        }
        for k in 0..self.k {
            if self.weights[k] < 0.0 || !self.weights[k].is_finite() {
                return false;
            }
            if !self.lobes[k].is_valid() {
                return false;
            }
            if !self.pivot_distances[k].is_finite() || self.pivot_distances[k] <= 0.0 {
                return false;
            }
        }
        true
    }
}
