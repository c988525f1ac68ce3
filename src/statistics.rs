//! Running pixel statistics for one readout.
//!
//! Pixels arrive as little-endian bytes split at arbitrary boundaries, so a
//! partial pixel at the end of a chunk is carried over to the next chunk of
//! the same channel.

use serde::Serialize;

use crate::geometry::DataType;

/// Summary values of the pixels sent so far.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatisticsSummary {
    /// Sum of pixel values
    pub sum: f64,
    /// Minimum pixel value, `None` before the first pixel
    pub min: Option<f64>,
    /// Maximum pixel value, `None` before the first pixel
    pub max: Option<f64>,
    /// Mean pixel value, `None` before the first pixel
    pub average: Option<f64>,
    /// Number of pixels decoded
    pub pixels: u64,
}

/// Accumulates statistics across the channels of a readout.
#[derive(Debug, Clone)]
pub struct ReadoutStatistics {
    data_type: DataType,
    sum: f64,
    min: f64,
    max: f64,
    pixels: u64,
    carry: Vec<Vec<u8>>,
}

impl ReadoutStatistics {
    /// New accumulator for `channels` independent streams.
    pub fn new(data_type: DataType, channels: usize) -> Self {
        Self {
            data_type,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            pixels: 0,
            carry: vec![Vec::new(); channels],
        }
    }

    /// Folds `data` sent on `channel` into the running values.
    pub fn update(&mut self, channel: usize, data: &[u8]) {
        let size = self.data_type.pixel_byte_size() as usize;
        let Some(carry) = self.carry.get_mut(channel) else {
            return;
        };

        let mut rest = data;
        if !carry.is_empty() {
            let need = size - carry.len();
            let take = need.min(rest.len());
            carry.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if carry.len() < size {
                return;
            }
            let pixel = std::mem::take(carry);
            self.accumulate(decode(self.data_type, &pixel));
        }

        let mut chunks = rest.chunks_exact(size);
        for pixel in chunks.by_ref() {
            self.accumulate(decode(self.data_type, pixel));
        }
        if let Some(carry) = self.carry.get_mut(channel) {
            carry.extend_from_slice(chunks.remainder());
        }
    }

    fn accumulate(&mut self, value: f64) {
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.pixels += 1;
    }

    /// Number of whole pixels decoded.
    pub fn pixels(&self) -> u64 {
        self.pixels
    }

    /// Snapshot of the running values.
    pub fn summary(&self) -> StatisticsSummary {
        let seen = self.pixels > 0;
        StatisticsSummary {
            sum: self.sum,
            min: seen.then_some(self.min),
            max: seen.then_some(self.max),
            average: seen.then(|| self.sum / self.pixels as f64),
            pixels: self.pixels,
        }
    }
}

fn decode(data_type: DataType, bytes: &[u8]) -> f64 {
    fn arr<const N: usize>(bytes: &[u8]) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&bytes[..N]);
        out
    }

    match data_type {
        DataType::Byte => f64::from(bytes[0]),
        DataType::SByte => f64::from(i8::from_le_bytes(arr(bytes))),
        DataType::Short => f64::from(i16::from_le_bytes(arr(bytes))),
        DataType::UShort => f64::from(u16::from_le_bytes(arr(bytes))),
        DataType::Long => f64::from(i32::from_le_bytes(arr(bytes))),
        DataType::ULong => f64::from(u32::from_le_bytes(arr(bytes))),
        DataType::LongLong => i64::from_le_bytes(arr(bytes)) as f64,
        DataType::Float => f64::from(f32::from_le_bytes(arr(bytes))),
        DataType::Double => f64::from_le_bytes(arr(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ushort_bytes(values: &[u16]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    #[test]
    fn test_summary_of_ushort_pixels() {
        let mut stats = ReadoutStatistics::new(DataType::UShort, 1);
        stats.update(0, &ushort_bytes(&[10, 20, 30, 40]));

        let summary = stats.summary();
        assert_eq!(summary.pixels, 4);
        assert_eq!(summary.sum, 100.0);
        assert_eq!(summary.min, Some(10.0));
        assert_eq!(summary.max, Some(40.0));
        assert_eq!(summary.average, Some(25.0));
    }

    #[test]
    fn test_split_pixel_is_carried() {
        let bytes = ushort_bytes(&[1000, 2000, 3000]);
        let mut stats = ReadoutStatistics::new(DataType::UShort, 1);
        stats.update(0, &bytes[..3]);
        assert_eq!(stats.pixels(), 1);
        stats.update(0, &bytes[3..4]);
        assert_eq!(stats.pixels(), 2);
        stats.update(0, &bytes[4..]);

        let summary = stats.summary();
        assert_eq!(summary.pixels, 3);
        assert_eq!(summary.sum, 6000.0);
    }

    #[test]
    fn test_channels_carry_independently() {
        let bytes = ushort_bytes(&[5, 7]);
        let mut stats = ReadoutStatistics::new(DataType::UShort, 2);
        stats.update(0, &bytes[..1]);
        stats.update(1, &bytes[2..3]);
        stats.update(0, &bytes[1..2]);
        stats.update(1, &bytes[3..]);
        assert_eq!(stats.summary().sum, 12.0);
    }

    #[test]
    fn test_empty_summary() {
        let stats = ReadoutStatistics::new(DataType::Float, 1);
        let summary = stats.summary();
        assert_eq!(summary.pixels, 0);
        assert!(summary.min.is_none());
        assert!(summary.average.is_none());
    }

    #[test]
    fn test_signed_and_float_decoding() {
        let mut stats = ReadoutStatistics::new(DataType::Short, 1);
        stats.update(0, &(-5i16).to_le_bytes());
        assert_eq!(stats.summary().min, Some(-5.0));

        let mut stats = ReadoutStatistics::new(DataType::Double, 1);
        stats.update(0, &2.5f64.to_le_bytes());
        assert_eq!(stats.summary().max, Some(2.5));
    }
}
