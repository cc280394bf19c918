//! Noise gate, gain normalisation and smoothing for captured PCM.
//!
//! Off by default: the upstream codec wants the device audio byte-identical,
//! so this only runs when `audio.conditioning` is enabled.

use super::resample::{pcm16_from_le_bytes, pcm16_to_le_bytes};

#[derive(Debug, Clone, PartialEq)]
pub struct ConditioningConfig {
    /// Samples quieter than this are zeroed
    pub noise_floor: i16,
    /// Peak amplitude the block is normalised towards
    pub peak_target: f32,
    /// Extra attenuation applied on top of normalisation
    pub gain: f32,
    /// Low-pass coefficient, 0..1
    pub smoothing: f32,
    /// Output is clamped to +/- this value
    pub max_value: f32,
    /// Blocks whose peak does not exceed this are dropped. 0 disables.
    pub silence_threshold: i16,
}

impl Default for ConditioningConfig {
    fn default() -> Self {
        Self {
            noise_floor: 15,
            peak_target: 32767.0,
            gain: 0.1,
            smoothing: 0.1,
            max_value: 32767.0 * 0.6,
            silence_threshold: 100,
        }
    }
}

impl ConditioningConfig {
    /// Condition one block of little-endian PCM16.
    ///
    /// Returns `None` when the block is below the silence threshold and
    /// should not be written at all.
    pub fn apply(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let samples = pcm16_from_le_bytes(bytes);
        if bytes.len() % 2 != 0 {
            log::debug!("Conditioning dropped a dangling odd byte");
        }

        let peak = samples
            .iter()
            .map(|s| (*s as i32).abs())
            .max()
            .unwrap_or(0);

        if self.silence_threshold > 0 && peak <= self.silence_threshold as i32 {
            log::debug!("Skipping block of {} bytes, peak {} below threshold", bytes.len(), peak);
            return None;
        }

        Some(pcm16_to_le_bytes(&self.process(&samples, peak)))
    }

    fn process(&self, samples: &[i16], peak: i32) -> Vec<i16> {
        let ratio = if peak > 0 {
            (self.peak_target / peak as f32) * self.gain
        } else {
            1.0
        };

        let mut prev = 0.0f32;
        samples
            .iter()
            .map(|&s| {
                if (s as i32).abs() < self.noise_floor as i32 {
                    return 0;
                }
                let scaled = s as f32 * ratio;
                let smoothed = prev + self.smoothing * (scaled - prev);
                prev = smoothed;
                smoothed.clamp(-self.max_value, self.max_value).round() as i16
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(samples: &[i16]) -> Vec<u8> {
        pcm16_to_le_bytes(samples)
    }

    #[test]
    fn quiet_block_is_skipped() {
        let cfg = ConditioningConfig::default();
        assert!(cfg.apply(&bytes(&[10, -50, 100, 0])).is_none());
    }

    #[test]
    fn silence_threshold_zero_keeps_everything() {
        let cfg = ConditioningConfig {
            silence_threshold: 0,
            ..Default::default()
        };
        let out = cfg.apply(&bytes(&[0, 0, 0])).unwrap();
        assert_eq!(out, bytes(&[0, 0, 0]));
    }

    #[test]
    fn samples_under_noise_floor_are_zeroed() {
        let cfg = ConditioningConfig::default();
        let out = pcm16_from_le_bytes(&cfg.apply(&bytes(&[5, -14, 20000, 3])).unwrap());
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 0);
        assert_eq!(out[3], 0);
        assert_ne!(out[2], 0);
    }

    #[test]
    fn output_is_clamped() {
        let cfg = ConditioningConfig {
            gain: 10.0,
            smoothing: 1.0,
            ..Default::default()
        };
        let out = pcm16_from_le_bytes(&cfg.apply(&bytes(&[32767, -32768, 16000])).unwrap());
        let limit = cfg.max_value.round() as i16;
        assert!(out.iter().all(|s| s.abs() <= limit));
        assert_eq!(out[0], limit);
    }

    #[test]
    fn low_pass_follows_first_order_recurrence() {
        let cfg = ConditioningConfig {
            gain: 1.0,
            peak_target: 1000.0,
            smoothing: 0.5,
            noise_floor: 0,
            silence_threshold: 0,
            max_value: 32767.0,
        };
        // peak 1000 -> ratio 1.0: y = 500, 750, 875
        let out = pcm16_from_le_bytes(&cfg.apply(&bytes(&[1000, 1000, 1000])).unwrap());
        assert_eq!(out, vec![500, 750, 875]);
    }
}
