//! vMF lobe kernel: evaluation, sampling, and the mean-cosine <-> kappa
//! maps shared by the EM factory, splitter and merger.

use std::f64::consts::PI;

/// Upper bound on concentration: finite, `<= kappa_max`.
pub const KAPPA_MAX: f64 = 1.0e4;

/// Below this kappa we use the series expansion for `mean_cosine` to avoid
/// catastrophic cancellation in `coth(k) - 1/k`.
const SERIES_THRESHOLD: f64 = 1.0e-3;

/// Numerically stable vMF normalisation constant:
/// `n(k) = k / (2*pi*(1 - exp(-2k)))`, rewritten for large k as
/// `k / (4*pi*sinh(k)*exp(-k))` to avoid overflow in `exp(2k)`.
pub fn normalization(kappa: f64) -> f64 {
    if kappa <= 0.0 {
        return 1.0 / (4.0 * PI);
    }
    if kappa > 50.0 {
        // sinh(k)*exp(-k) -> 0.5 as k grows; avoid computing exp(2k).
        kappa / (2.0 * PI * (1.0 - (-2.0 * kappa).exp()))
    } else {
        kappa / (4.0 * PI * kappa.sinh() * (-kappa).exp())
    }
}

/// `f(w; mu, k) = n(k) * exp(k*(mu.w - 1))`, with the exponent shifted by
/// `-k` so it never exceeds zero.
pub fn eval(mu: [f64; 3], kappa: f64, omega: [f64; 3]) -> f64 {
    let cos_theta = dot(mu, omega).clamp(-1.0, 1.0);
    normalization(kappa) * (kappa * (cos_theta - 1.0)).exp()
}

/// Draws a direction from vMF(mu, kappa) given two independent uniforms in
/// `[0, 1)`, by the standard inverse-CDF trick on `cos(theta)`.
pub fn sample(mu: [f64; 3], kappa: f64, u1: f64, u2: f64) -> [f64; 3] {
    let cos_theta = if kappa < 1.0e-6 {
        // Degenerate to uniform sampling on the sphere.
        1.0 - 2.0 * u1
    } else {
        1.0 + (1.0 / kappa) * (u1 + (1.0 - u1) * (-2.0 * kappa).exp()).ln()
    };
    let cos_theta = cos_theta.clamp(-1.0, 1.0);
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let phi = 2.0 * PI * u2;

    let local = [sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta];
    normalize(rotate_to_frame(mu, local))
}

/// `coth(k) - 1/k`, the mean resultant length of vMF(., k). Uses a series
/// expansion near zero to avoid cancellation.
pub fn mean_cosine(kappa: f64) -> f64 {
    if kappa.abs() < SERIES_THRESHOLD {
        kappa / 3.0 - kappa.powi(3) / 45.0
    } else {
        1.0 / kappa.tanh() - 1.0 / kappa
    }
}

/// Closed-form approximation inverting `mean_cosine`:
/// `kappa = r*(3 - r^2) / (1 - r^2)`, clamped to `[0, KAPPA_MAX]`.
pub fn kappa_from_mean_cosine(r: f64) -> f64 {
    let r = r.clamp(0.0, 1.0 - 1.0e-6);
    if r <= 0.0 {
        return 0.0;
    }
    let kappa = r * (3.0 - r * r) / (1.0 - r * r);
    kappa.clamp(0.0, KAPPA_MAX)
}

pub fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn norm(a: [f64; 3]) -> f64 {
    dot(a, a).sqrt()
}

pub fn normalize(a: [f64; 3]) -> [f64; 3] {
    let n = norm(a);
    if n > 0.0 {
        [a[0] / n, a[1] / n, a[2] / n]
    } else {
        [0.0, 0.0, 1.0]
    }
}

pub fn scale(a: [f64; 3], s: f64) -> [f64; 3] {
    [a[0] * s, a[1] * s, a[2] * s]
}

pub fn add(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn sub(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Rotates a point expressed in the canonical frame (z-up) into the frame
/// whose z-axis is `mu`.
fn rotate_to_frame(mu: [f64; 3], local: [f64; 3]) -> [f64; 3] {
    let z = normalize(mu);
    // Pick a stable "up" reference to build an orthonormal basis from.
    let up = if z[2].abs() < 0.999 {
        [0.0, 0.0, 1.0]
    } else {
        [1.0, 0.0, 0.0]
    };
    let x = normalize(cross(up, z));
    let y = cross(z, x);
    add(
        add(scale(x, local[0]), scale(y, local[1])),
        scale(z, local[2]),
    )
}

/// A single von Mises-Fisher lobe: mean direction, concentration, and its
/// cached normalisation constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VmfLobe {
    pub mu: [f64; 3],
    pub kappa: f64,
}

impl VmfLobe {
    pub fn new(mu: [f64; 3], kappa: f64) -> Self {
        VmfLobe {
            mu: normalize(mu),
            kappa: kappa.clamp(0.0, KAPPA_MAX),
        }
    }

    pub fn eval(&self, omega: [f64; 3]) -> f64 {
        eval(self.mu, self.kappa, omega)
    }

    pub fn sample(&self, u1: f64, u2: f64) -> [f64; 3] {
        sample(self.mu, self.kappa, u1, u2)
    }

    pub fn is_valid(&self) -> bool {
        self.mu.iter().all(|v| v.is_finite())
            && (norm(self.mu) - 1.0).abs() < 1.0e-6
            && self.kappa.is_finite()
            && self.kappa >= 0.0
            && self.kappa <= KAPPA_MAX
    }
}
