//! Sample block sources feeding the pacing engine

use std::f64::consts::PI;

use crate::constants::ZERO_DBM;

/// Producer of fixed-size interleaved I/Q blocks, selected by packet index
pub trait BlockSource {
    /// Complex samples per block
    fn samples_per_block(&self) -> usize;

    /// Interleaved block for packet `index`
    fn block(&mut self, index: usize) -> &[f32];
}

/// Alternating chirp sweep
///
/// Two blocks are computed once: the forward sweep and its mirror.
/// Even packet indices get the forward block, odd indices the reverse one.
#[derive(Debug, Clone)]
pub struct SweepSource {
    forward: Vec<f32>,
    reverse: Vec<f32>,
    amplitude: f64,
}

impl SweepSource {
    pub fn new(samples: usize, amplitude: f64) -> Self {
        let mut forward = vec![0.0f32; samples * 2];
        let mut reverse = vec![0.0f32; samples * 2];

        let mut w = 0.0f64;
        for k in 0..samples {
            let phi = ((k as f64 / samples as f64) * 2.0 - 1.0) * PI;
            w += phi;

            forward[2 * k] = (w.sin() * amplitude) as f32;
            forward[2 * k + 1] = (w.cos() * amplitude) as f32;

            reverse[2 * k] = ((-w).sin() * amplitude) as f32;
            reverse[2 * k + 1] = ((-w).cos() * amplitude) as f32;
        }

        Self {
            forward,
            reverse,
            amplitude,
        }
    }

    /// Sweep at the 0 dBm reference amplitude
    pub fn reference(samples: usize) -> Self {
        Self::new(samples, ZERO_DBM)
    }

    pub fn amplitude(&self) -> f64 {
        self.amplitude
    }

    pub fn forward(&self) -> &[f32] {
        &self.forward
    }

    pub fn reverse(&self) -> &[f32] {
        &self.reverse
    }
}

impl BlockSource for SweepSource {
    fn samples_per_block(&self) -> usize {
        self.forward.len() / 2
    }

    fn block(&mut self, index: usize) -> &[f32] {
        if index % 2 == 0 {
            &self.forward
        } else {
            &self.reverse
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_layout() {
        let mut source = SweepSource::reference(1024);
        assert_eq!(source.samples_per_block(), 1024);
        assert_eq!(source.block(0).len(), 2048);

        // First sample: phi(0) = -pi, so w = -pi
        let first = source.block(0);
        assert!((first[0] as f64 - (-PI).sin() * ZERO_DBM).abs() < 1e-6);
        assert!((first[1] as f64 - (-PI).cos() * ZERO_DBM).abs() < 1e-6);
    }

    #[test]
    fn test_alternating_direction() {
        let mut source = SweepSource::new(256, 1.0);
        let forward = source.block(0).to_vec();
        let reverse = source.block(1).to_vec();
        assert_eq!(source.block(2), &forward[..]);
        assert_eq!(source.block(7), &reverse[..]);

        // Mirror: I flips sign, Q is unchanged
        for k in 0..256 {
            assert!((forward[2 * k] + reverse[2 * k]).abs() < 1e-6);
            assert!((forward[2 * k + 1] - reverse[2 * k + 1]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_constant_envelope() {
        let mut source = SweepSource::reference(4096);
        for index in 0..2 {
            let block = source.block(index);
            for pair in block.chunks_exact(2) {
                let magnitude = ((pair[0] * pair[0] + pair[1] * pair[1]) as f64).sqrt();
                assert!((magnitude - ZERO_DBM).abs() < 1e-5);
            }
        }
    }
}
