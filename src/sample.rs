//! Directional samples streamed in from path tracing.
//!
//! A `DirectionalSample` is an immutable record: position, direction,
//! weight, pdf, distance, and a small flag bitfield. The binary record
//! format is little-endian, packed, 36 bytes per record:
//! `{float3 position; float3 direction; float weight; float pdf; float distance; uint32 flags;}`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

use crate::error::{GuideError, Result};

pub const RECORD_SIZE_BYTES: usize = 36;

/// Typed wrapper around the record's integer flag bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleFlags(u32);

impl SampleFlags {
    pub const SPLATTED: u32 = 1 << 0;
    pub const INSIDE_VOLUME: u32 = 1 << 1;

    pub fn new(bits: u32) -> Self {
        SampleFlags(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_splatted(self) -> bool {
        self.0 & Self::SPLATTED != 0
    }

    pub fn is_inside_volume(self) -> bool {
        self.0 & Self::INSIDE_VOLUME != 0
    }

    pub fn set_splatted(&mut self, value: bool) {
        self.set_bit(Self::SPLATTED, value);
    }

    pub fn set_inside_volume(&mut self, value: bool) {
        self.set_bit(Self::INSIDE_VOLUME, value);
    }

    fn set_bit(&mut self, bit: u32, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// A single radiance sample collected by path tracing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalSample {
    pub position: [f32; 3],
    pub direction: [f32; 3],
    pub weight: f32,
    pub pdf: f32,
    pub distance: f32,
    pub flags: SampleFlags,
}

impl DirectionalSample {
    pub fn new(
        position: [f32; 3],
        direction: [f32; 3],
        weight: f32,
        pdf: f32,
        distance: f32,
        flags: SampleFlags,
    ) -> Self {
        DirectionalSample {
            position,
            direction,
            weight,
            pdf,
            distance,
            flags,
        }
    }

    /// Directional weight used throughout EM: ŵ_i = weight / pdf.
    pub fn directional_weight(&self) -> f32 {
        self.weight / self.pdf
    }

    /// Validity predicate: all floats finite, weight >= 0,
    /// pdf > 0, distance > 0.
    pub fn is_valid(&self) -> bool {
        self.position.iter().all(|v| v.is_finite())
            && self.direction.iter().all(|v| v.is_finite())
            && self.weight.is_finite()
            && self.weight >= 0.0
            && self.pdf.is_finite()
            && self.pdf > 0.0
            && self.distance.is_finite()
            && self.distance > 0.0
    }

    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let mut position = [0f32; 3];
        for p in position.iter_mut() {
            *p = reader.read_f32::<LittleEndian>()?;
        }
        let mut direction = [0f32; 3];
        for d in direction.iter_mut() {
            *d = reader.read_f32::<LittleEndian>()?;
        }
        let weight = reader.read_f32::<LittleEndian>()?;
        let pdf = reader.read_f32::<LittleEndian>()?;
        let distance = reader.read_f32::<LittleEndian>()?;
        let flags = reader.read_u32::<LittleEndian>()?;
        Ok(DirectionalSample {
            position,
            direction,
            weight,
            pdf,
            distance,
            flags: SampleFlags::new(flags),
        })
    }

    fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        for p in self.position {
            writer.write_f32::<LittleEndian>(p)?;
        }
        for d in self.direction {
            writer.write_f32::<LittleEndian>(d)?;
        }
        writer.write_f32::<LittleEndian>(self.weight)?;
        writer.write_f32::<LittleEndian>(self.pdf)?;
        writer.write_f32::<LittleEndian>(self.distance)?;
        writer.write_u32::<LittleEndian>(self.flags.bits())?;
        Ok(())
    }
}

/// Reads `uint64 N` followed by N packed records: the counterpart that
/// `write_records` below must round-trip with.
pub fn read_records<R: Read>(reader: &mut R) -> Result<Vec<DirectionalSample>> {
    let n = reader.read_u64::<LittleEndian>()?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        out.push(DirectionalSample::read(reader)?);
    }
    Ok(out)
}

/// Writes `uint64 N` followed by the N records themselves.
///
/// Writes the records themselves, not the address of the backing array.
pub fn write_records<W: Write>(writer: &mut W, records: &[DirectionalSample]) -> Result<()> {
    writer.write_u64::<LittleEndian>(records.len() as u64)?;
    for record in records {
        record.write(writer)?;
    }
    Ok(())
}

/// Filters a raw batch down to valid samples: non-finite or out-of-domain
/// samples are dropped silently; the caller is expected to add the dropped
/// count to `AsmFittingStatistics`.
pub fn filter_valid(samples: &[DirectionalSample]) -> (Vec<DirectionalSample>, usize) {
    let mut valid = Vec::with_capacity(samples.len());
    let mut dropped = 0usize;
    for s in samples {
        if s.is_valid() {
            valid.push(*s);
        } else {
            dropped += 1;
        }
    }
    (valid, dropped)
}

/// Sanity bound used when reading an externally supplied sample count,
/// guarding against `SerializationMismatch` on corrupted files.
pub fn check_record_count(n: u64, max_reasonable: u64) -> Result<()> {
    if n > max_reasonable {
        return Err(GuideError::SerializationMismatch {
            reason: "record count exceeds sanity bound".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(i: f32) -> DirectionalSample {
        let mut flags = SampleFlags::default();
        flags.set_inside_volume(true);
        DirectionalSample::new([i, i + 1.0, i + 2.0], [0.0, 0.0, 1.0], 1.0, 1.0, 2.0, flags)
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let records = vec![sample(0.0), sample(10.0), sample(-3.5)];
        let mut buf = Vec::new();
        write_records(&mut buf, &records).unwrap();
        assert_eq!(buf.len(), 8 + records.len() * RECORD_SIZE_BYTES);
        let read_back = read_records(&mut buf.as_slice()).unwrap();
        assert_eq!(read_back, records);
    }

    #[test]
    fn flags_round_trip() {
        let mut f = SampleFlags::default();
        assert!(!f.is_splatted());
        f.set_splatted(true);
        assert!(f.is_splatted());
        f.set_splatted(false);
        assert!(!f.is_splatted());
    }

    #[test]
    fn validity_rejects_non_finite_and_out_of_domain() {
        let mut s = sample(0.0);
        assert!(s.is_valid());
        s.pdf = 0.0;
        assert!(!s.is_valid());
        s.pdf = 1.0;
        s.weight = -1.0;
        assert!(!s.is_valid());
        s.weight = 1.0;
        s.distance = f32::NAN;
        assert!(!s.is_valid());
    }

    #[test]
    fn filter_valid_drops_silently() {
        let mut bad = sample(0.0);
        bad.pdf = -1.0;
        let batch = vec![sample(0.0), bad, sample(1.0)];
        let (valid, dropped) = filter_valid(&batch);
        assert_eq!(valid.len(), 2);
        assert_eq!(dropped, 1);
    }
}
