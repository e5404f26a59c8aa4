//! Per-sample query facade consumed by the renderer.

use crate::mixture::Mixture;

/// Parallax-compensated view onto a region's mixture, scoped to one surface
/// query. Mirrors the external sampling-distribution contract: init once,
/// then sample/pdf/applyCosineProduct repeatedly against the same query
/// position.
#[derive(Debug, Clone)]
pub struct SurfaceSamplingDistribution {
    mixture: Mixture,
    query_position: [f64; 3],
}

impl SurfaceSamplingDistribution {
    /// Initialises the distribution at `position` against the given
    /// region mixture, applying parallax compensation if the query
    /// position differs from the mixture's pivot. `sample1d` is accepted
    /// to match the external contract (stochastic candidate selection
    /// among several nearby mixtures is the Field collaborator's
    /// responsibility, not this core's); it is unused here since this
    /// type only ever wraps one already-selected mixture. Returns `false`
    /// iff the resulting mixture is invalid (e.g. all weight collapsed to
    /// zero).
    pub fn init(mixture: &Mixture, position: [f64; 3], _sample1d: f64) -> (Self, bool) {
        let compensated = mixture.with_parallax_compensation(position);
        let valid = compensated.is_valid();
        (
            SurfaceSamplingDistribution {
                mixture: compensated,
                query_position: position,
            },
            valid,
        )
    }

    pub fn sample(&self, u1: f64, u2: f64) -> [f64; 3] {
        self.mixture.sample(u1, u2).0
    }

    pub fn pdf(&self, direction: [f64; 3]) -> f64 {
        self.mixture.pdf(direction)
    }

    pub fn sample_pdf(&self, u1: f64, u2: f64) -> ([f64; 3], f64) {
        self.mixture.sample_pdf(u1, u2)
    }

    pub fn supports_apply_cosine_product(&self) -> bool {
        self.mixture.supports_apply_cosine_product()
    }

    /// Applies the cosine product in place; returns whether the kernel
    /// supports it, propagated rather than discarded.
    pub fn apply_cosine_product(&mut self, normal: [f64; 3]) -> bool {
        let supported = self.mixture.supports_apply_cosine_product();
        if supported {
            self.mixture.apply_cosine_product(normal);
        }
        supported
    }

    pub fn validate(&self) -> bool {
        self.mixture.is_valid()
    }

    /// Reverts the wrapped mixture to a uniform single lobe at the current
    /// query position.
    pub fn clear(&mut self) {
        self.mixture = Mixture::uniform(self.query_position);
    }

    pub fn region_mixture(&self) -> &Mixture {
        &self.mixture
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lobe::{self, VmfLobe};

    fn sample_mixture() -> Mixture {
        Mixture::from_components(&[1.0], &[VmfLobe::new([0.0, 0.0, 1.0], 30.0)], &[10.0], [0.0; 3])
    }

    #[test]
    fn init_applies_parallax_and_reports_validity() {
        let mix = sample_mixture();
        let (dist, ok) = SurfaceSamplingDistribution::init(&mix, [5.0, 0.0, 0.0], 0.5);
        assert!(ok);
        assert!(dist.validate());
    }

    #[test]
    fn apply_cosine_product_propagates_capability_bit() {
        let mix = sample_mixture();
        let (mut dist, _) = SurfaceSamplingDistribution::init(&mix, [0.0; 3], 0.1);
        let supported = dist.apply_cosine_product([0.0, 0.0, 1.0]);
        assert!(supported);
        assert!(dist.supports_apply_cosine_product());
    }

    #[test]
    fn clear_reverts_to_uniform() {
        let mix = sample_mixture();
        let (mut dist, _) = SurfaceSamplingDistribution::init(&mix, [1.0, 2.0, 3.0], 0.0);
        dist.clear();
        assert_eq!(dist.region_mixture().num_components(), 1);
        assert!((dist.region_mixture().weight(0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sample_then_pdf_is_finite_and_nonnegative() {
        use rand::{Rng, SeedableRng};
        let mix = sample_mixture();
        let (dist, _) = SurfaceSamplingDistribution::init(&mix, [2.0, 0.0, 0.0], 0.2);
        let mut rng = rand::rngs::StdRng::seed_from_u64(9);
        for _ in 0..50 {
            let u1: f64 = rng.gen();
            let u2: f64 = rng.gen();
            let omega = dist.sample(u1, u2);
            let p = dist.pdf(omega);
            assert!(p.is_finite() && p >= 0.0);
            assert!((lobe::norm(omega) - 1.0).abs() < 1e-9);
        }
    }
}
