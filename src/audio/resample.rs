//! Linear-interpolation resampling for mono 16-bit PCM.

/// Resample `samples` from `source_rate` to `target_rate`.
///
/// Output length is `floor(len * target / source)`, computed in integers.
/// Output sample `i` interpolates between the two input samples around
/// `i * source / target`; the right-hand neighbour is clamped to the last input sample.
pub fn resample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if source_rate == target_rate {
        return samples.to_vec();
    }
    if samples.is_empty() || source_rate == 0 || target_rate == 0 {
        return Vec::new();
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = (samples.len() as u64 * target_rate as u64 / source_rate as u64) as usize;
    let last = samples.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = (pos.floor() as usize).min(last);
        let frac = pos - idx as f64;

        let left = samples[idx] as f64;
        let right = samples[(idx + 1).min(last)] as f64;

        out.push((left * (1.0 - frac) + right * frac).round() as i16);
    }
    out
}

/// Decode little-endian 16-bit PCM. A dangling odd byte is ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Resample a little-endian PCM16 byte buffer.
pub fn resample_bytes(bytes: &[u8], source_rate: u32, target_rate: u32) -> Vec<u8> {
    if source_rate == target_rate {
        return bytes.to_vec();
    }
    let samples = pcm16_from_le_bytes(bytes);
    pcm16_to_le_bytes(&resample(&samples, source_rate, target_rate))
}
