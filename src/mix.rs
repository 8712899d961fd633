//! N-stream weighted sum over interleaved byte buffers.

use dasp_sample::Sample;

use crate::sample::{SampleFormat, SampleSpec};

/// One stream taking part in a mix.
#[derive(Clone, Copy, Debug)]
pub struct MixInput<'a> {
    pub data: &'a [u8],
    /// Linear gain per channel. Missing channels play at unity.
    pub volumes: &'a [f32],
}

impl<'a> MixInput<'a> {
    pub fn new(data: &'a [u8], volumes: &'a [f32]) -> Self {
        Self { data, volumes }
    }
}

/// Mix `inputs` into `out`.
///
/// All inputs are interpreted in `spec`. Only whole frames of `out` are
/// written; inputs shorter than `out` contribute silence past their end.
/// The sum is clamped to the format's range.
pub fn mix(inputs: &[MixInput<'_>], spec: &SampleSpec, out: &mut [u8]) {
    let bps = spec.format.bytes_per_sample();
    let channels = spec.channels as usize;
    let samples = spec.frame_align(out.len()) / bps;

    for i in 0..samples {
        let ch = i % channels;
        let offset = i * bps;

        let mut acc = 0.0f32;
        for input in inputs {
            if offset + bps > input.data.len() {
                continue;
            }
            let gain = input.volumes.get(ch).copied().unwrap_or(1.0);
            acc += read_sample(spec.format, &input.data[offset..offset + bps]) * gain;
        }

        write_sample(spec.format, acc.clamp(-1.0, 1.0), &mut out[offset..offset + bps]);
    }
}

#[inline]
fn read_sample(format: SampleFormat, bytes: &[u8]) -> f32 {
    match format {
        SampleFormat::U8 => bytes[0].to_sample::<f32>(),
        SampleFormat::S16Le => i16::from_le_bytes([bytes[0], bytes[1]]).to_sample::<f32>(),
        SampleFormat::F32Le => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
    }
}

#[inline]
fn write_sample(format: SampleFormat, value: f32, bytes: &mut [u8]) {
    match format {
        SampleFormat::U8 => bytes[0] = value.to_sample::<u8>(),
        SampleFormat::S16Le => bytes.copy_from_slice(&value.to_sample::<i16>().to_le_bytes()),
        SampleFormat::F32Le => bytes.copy_from_slice(&value.to_le_bytes()),
    }
}

/// Encode float samples as an `F32Le` buffer.
pub fn f32_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

pub fn bytes_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn mixes_two_float_streams_at_unity() {
        let spec = SampleSpec::new(SampleFormat::F32Le, 48_000, 2);
        let a = f32_to_bytes(&[0.25, -0.5, 0.1, 0.0]);
        let b = f32_to_bytes(&[0.25, 0.25, 0.2, -0.3]);
        let unity = [1.0, 1.0];

        let mut out = vec![0u8; a.len()];
        mix(&[MixInput::new(&a, &unity), MixInput::new(&b, &unity)], &spec, &mut out);

        let mixed = bytes_to_f32(&out);
        for (got, want) in mixed.iter().zip([0.5, -0.25, 0.3, -0.3]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn applies_per_channel_volume() {
        let spec = SampleSpec::new(SampleFormat::F32Le, 48_000, 2);
        let a = f32_to_bytes(&[0.5, 0.5]);

        let mut out = vec![0u8; a.len()];
        mix(&[MixInput::new(&a, &[0.5, 0.0])], &spec, &mut out);

        let mixed = bytes_to_f32(&out);
        assert_abs_diff_eq!(mixed[0], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(mixed[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn clamps_s16() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 48_000, 1);
        let loud: Vec<u8> = i16::MAX.to_le_bytes().to_vec();

        let mut out = vec![0u8; 2];
        mix(&[MixInput::new(&loud, &[]), MixInput::new(&loud, &[])], &spec, &mut out);

        assert_eq!(i16::from_le_bytes([out[0], out[1]]), i16::MAX);
    }

    #[test]
    fn s16_streams_sum_in_float() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 48_000, 1);
        let a = 8_192i16.to_le_bytes();
        let b = (-4_096i16).to_le_bytes();

        let mut out = vec![0u8; 2];
        mix(&[MixInput::new(&a, &[]), MixInput::new(&b, &[0.5])], &spec, &mut out);

        assert_eq!(i16::from_le_bytes([out[0], out[1]]), 6_144);
    }

    #[test]
    fn u8_silence_stays_silent() {
        let spec = SampleSpec::new(SampleFormat::U8, 8_000, 1);
        let quiet = vec![0x80u8; 4];

        let mut out = vec![0u8; 4];
        mix(&[MixInput::new(&quiet, &[]), MixInput::new(&quiet, &[])], &spec, &mut out);

        assert_eq!(out, vec![0x80; 4]);
    }
}
