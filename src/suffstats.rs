//! Running sufficient statistics for the weighted EM loop.
//!
//! Sums accumulate in `f64` even though lobe parameters are read back as
//! `f32`-range values, to keep long-running accumulation numerically
//! stable.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{GuideError, Result};
use crate::mixture::K_MAX;

#[derive(Debug, Clone)]
pub struct SufficientStatistics {
    k: usize,
    /// Sigma gamma_ik (responsibility mass) per component.
    sum_gamma: [f64; K_MAX],
    /// Sigma gamma_ik * omega_i (vector moment) per component.
    sum_gamma_omega: [[f64; 3]; K_MAX],
    /// Sigma gamma_ik / d_i (inverse-distance moment) per component.
    sum_gamma_inv_distance: [f64; K_MAX],
    /// Totals across all components.
    sum_weights: f64,
    num_samples: u64,
    num_batches: u64,
}

impl SufficientStatistics {
    pub fn new(k: usize) -> Self {
        let mut s = SufficientStatistics {
            k,
            sum_gamma: [0.0; K_MAX],
            sum_gamma_omega: [[0.0; 3]; K_MAX],
            sum_gamma_inv_distance: [0.0; K_MAX],
            sum_weights: 0.0,
            num_samples: 0,
            num_batches: 0,
        };
        s.clear(k);
        s
    }

    pub fn num_components(&self) -> usize {
        self.k
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples
    }

    pub fn num_batches(&self) -> u64 {
        self.num_batches
    }

    pub fn sum_weights(&self) -> f64 {
        self.sum_weights
    }

    pub fn sum_gamma(&self, k: usize) -> f64 {
        self.sum_gamma[k]
    }

    pub fn sum_gamma_omega(&self, k: usize) -> [f64; 3] {
        self.sum_gamma_omega[k]
    }

    pub fn sum_gamma_inv_distance(&self, k: usize) -> f64 {
        self.sum_gamma_inv_distance[k]
    }

    pub(crate) fn accumulate(
        &mut self,
        k: usize,
        gamma_weighted: f64,
        gamma_weighted_omega: [f64; 3],
        gamma_weighted_inv_distance: f64,
    ) {
        self.sum_gamma[k] += gamma_weighted;
        for i in 0..3 {
            self.sum_gamma_omega[k][i] += gamma_weighted_omega[i];
        }
        self.sum_gamma_inv_distance[k] += gamma_weighted_inv_distance;
    }

    pub(crate) fn accumulate_totals(&mut self, directional_weight: f64) {
        self.sum_weights += directional_weight;
    }

    pub(crate) fn add_samples(&mut self, n: u64) {
        self.num_samples += n;
    }

    pub(crate) fn add_batch(&mut self) {
        self.num_batches += 1;
    }

    /// Adds another statistics object's sums into this one component-wise.
    /// Used by the EM factory to combine a frozen prior with a batch-local
    /// accumulation into the total the M-step reads from.
    pub(crate) fn merge_add(&mut self, other: &SufficientStatistics) {
        assert_eq!(self.k, other.k);
        for k in 0..self.k {
            self.sum_gamma[k] += other.sum_gamma[k];
            for i in 0..3 {
                self.sum_gamma_omega[k][i] += other.sum_gamma_omega[k][i];
            }
            self.sum_gamma_inv_distance[k] += other.sum_gamma_inv_distance[k];
        }
        self.sum_weights += other.sum_weights;
        self.num_samples += other.num_samples;
    }

    /// Zeroes all sums, sets the component count.
    pub fn clear(&mut self, k: usize) {
        assert!(k >= 1 && k <= K_MAX);
        self.k = k;
        self.sum_gamma = [0.0; K_MAX];
        self.sum_gamma_omega = [[0.0; 3]; K_MAX];
        self.sum_gamma_inv_distance = [0.0; K_MAX];
        self.sum_weights = 0.0;
        self.num_samples = 0;
    }

    /// Multiplies every sum (including totals and sample count) by `alpha`.
    /// `decay(1.0)` is a no-op by construction.
    pub fn decay(&mut self, alpha: f64) {
        for k in 0..self.k {
            self.sum_gamma[k] *= alpha;
            for i in 0..3 {
                self.sum_gamma_omega[k][i] *= alpha;
            }
            self.sum_gamma_inv_distance[k] *= alpha;
        }
        self.sum_weights *= alpha;
        self.num_samples = (self.num_samples as f64 * alpha).round() as u64;
    }

    /// For every `k` with `mask[k]` true, overwrites component k's moments
    /// with `other`'s; the rest are untouched.
    pub fn masked_replace(&mut self, mask: &[bool], other: &SufficientStatistics) {
        assert_eq!(self.k, other.k);
        for k in 0..self.k {
            if mask.get(k).copied().unwrap_or(false) {
                self.sum_gamma[k] = other.sum_gamma[k];
                self.sum_gamma_omega[k] = other.sum_gamma_omega[k];
                self.sum_gamma_inv_distance[k] = other.sum_gamma_inv_distance[k];
            }
        }
    }

    /// Shrinks or grows to `k_new` components; new slots are zero.
    pub fn set_num_components(&mut self, k_new: usize) {
        assert!(k_new >= 1 && k_new <= K_MAX);
        if k_new > self.k {
            for k in self.k..k_new {
                self.sum_gamma[k] = 0.0;
                self.sum_gamma_omega[k] = [0.0; 3];
                self.sum_gamma_inv_distance[k] = 0.0;
            }
        }
        self.k = k_new;
    }

    /// Compacts index `src` into `dst`, zeroing `src` out -- used by the
    /// merger/splitter when the last component is swapped into a vacated
    /// slot.
    pub(crate) fn move_component(&mut self, src: usize, dst: usize) {
        self.sum_gamma[dst] = self.sum_gamma[src];
        self.sum_gamma_omega[dst] = self.sum_gamma_omega[src];
        self.sum_gamma_inv_distance[dst] = self.sum_gamma_inv_distance[src];
        self.sum_gamma[src] = 0.0;
        self.sum_gamma_omega[src] = [0.0; 3];
        self.sum_gamma_inv_distance[src] = 0.0;
    }

    /// Overwrites component `k`'s moments directly, used by the merger to
    /// set the merged component's sums to the componentwise sum of its two
    /// parents.
    pub(crate) fn overwrite_component(&mut self, k: usize, sum_gamma: f64, sum_gamma_omega: [f64; 3], sum_gamma_inv_distance: f64) {
        self.sum_gamma[k] = sum_gamma;
        self.sum_gamma_omega[k] = sum_gamma_omega;
        self.sum_gamma_inv_distance[k] = sum_gamma_inv_distance;
    }

    pub(crate) fn zero_component(&mut self, k: usize) {
        self.sum_gamma[k] = 0.0;
        self.sum_gamma_omega[k] = [0.0; 3];
        self.sum_gamma_inv_distance[k] = 0.0;
    }

    pub fn is_valid(&self) -> bool {
        if self.k == 0 || self.k > K_MAX {
            return false;
        }
        if !self.sum_weights.is_finite() {
            return false;
        }
        for k in 0..self.k {
            if !self.sum_gamma[k].is_finite() {
                return false;
            }
            if !self.sum_gamma_omega[k].iter().all(|v| v.is_finite()) {
                return false;
            }
            if !self.sum_gamma_inv_distance[k].is_finite() {
                return false;
            }
        }
        true
    }

    /// Writes all fields as little-endian IEEE-754 floats and fixed-width
    /// integers, in declaration order.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<LittleEndian>(self.k as u64)?;
        for k in 0..self.k {
            writer.write_f64::<LittleEndian>(self.sum_gamma[k])?;
            for v in self.sum_gamma_omega[k] {
                writer.write_f64::<LittleEndian>(v)?;
            }
            writer.write_f64::<LittleEndian>(self.sum_gamma_inv_distance[k])?;
        }
        writer.write_f64::<LittleEndian>(self.sum_weights)?;
        writer.write_u64::<LittleEndian>(self.num_samples)?;
        writer.write_u64::<LittleEndian>(self.num_batches)?;
        Ok(())
    }

    pub fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let k = reader.read_u64::<LittleEndian>()? as usize;
        if k == 0 || k > K_MAX {
            return Err(GuideError::SerializationMismatch {
                reason: "component count out of [1, K_MAX] bounds".to_string(),
            });
        }
        let mut s = SufficientStatistics::new(k);
        for kk in 0..k {
            s.sum_gamma[kk] = reader.read_f64::<LittleEndian>()?;
            let mut v = [0.0; 3];
            for vv in v.iter_mut() {
                *vv = reader.read_f64::<LittleEndian>()?;
            }
            s.sum_gamma_omega[kk] = v;
            s.sum_gamma_inv_distance[kk] = reader.read_f64::<LittleEndian>()?;
        }
        s.sum_weights = reader.read_f64::<LittleEndian>()?;
        s.num_samples = reader.read_u64::<LittleEndian>()?;
        s.num_batches = reader.read_u64::<LittleEndian>()?;
        if !s.is_valid() {
            return Err(GuideError::SerializationMismatch {
                reason: "deserialized sufficient statistics failed validity check".to_string(),
            });
        }
        Ok(s)
    }
}
