//! Sample formats, channel maps and per-channel volumes.
//!
//! Everything the node moves around is raw interleaved bytes. These types
//! carry the information needed to interpret them: how big a frame is, how
//! many frames make up a given duration, and which channel sits where.

use serde::Deserialize;

/// Microseconds. All latencies in this crate are expressed in this unit.
pub type Usec = u64;

pub const USEC_PER_SEC: Usec = 1_000_000;
pub const USEC_PER_MSEC: Usec = 1_000;

/// Encoding of a single sample.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Unsigned 8 bit, silence at 0x80
    U8,
    /// Signed 16 bit little endian
    S16Le,
    /// 32 bit IEEE float little endian, nominal range [-1.0, 1.0]
    F32Le,
}

impl SampleFormat {
    #[inline]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::F32Le => 4,
        }
    }

    /// The byte pattern a silent sample is made of.
    #[inline]
    pub fn silence_byte(self) -> u8 {
        match self {
            SampleFormat::U8 => 0x80,
            SampleFormat::S16Le | SampleFormat::F32Le => 0,
        }
    }
}

/// Format, rate and channel count of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u8,
}

impl SampleSpec {
    pub fn new(format: SampleFormat, rate: u32, channels: u8) -> Self {
        Self { format, rate, channels }
    }

    /// Size of one frame (one sample for every channel) in bytes.
    #[inline]
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    pub fn is_valid(&self) -> bool {
        self.rate > 0 && self.channels > 0
    }

    /// Round `nbytes` down to a whole number of frames.
    #[inline]
    pub fn frame_align(&self, nbytes: usize) -> usize {
        let fs = self.frame_size();
        nbytes - nbytes % fs
    }

    /// Largest whole-frame buffer within `max_bytes`, never less than one frame.
    #[inline]
    pub fn block_bytes(&self, max_bytes: usize) -> usize {
        self.frame_align(max_bytes).max(self.frame_size()).max(1)
    }

    /// Duration of `nbytes` of audio in this format. Partial frames are ignored.
    pub fn bytes_to_usec(&self, nbytes: usize) -> Usec {
        let frames = (nbytes / self.frame_size()) as u64;
        frames * USEC_PER_SEC / self.rate as u64
    }

    /// Number of bytes (whole frames, rounded down) covering `usec`.
    pub fn usec_to_bytes(&self, usec: Usec) -> usize {
        let frames = usec * self.rate as u64 / USEC_PER_SEC;
        frames as usize * self.frame_size()
    }
}

/// Speaker position of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelPosition {
    Mono,
    FrontLeft,
    FrontRight,
    FrontCenter,
    RearLeft,
    RearRight,
    RearCenter,
    Lfe,
    SideLeft,
    SideRight,
    Aux(u8),
}

/// Ordered speaker positions, one per channel.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct ChannelMap {
    positions: Vec<ChannelPosition>,
}

impl ChannelMap {
    pub fn new(positions: Vec<ChannelPosition>) -> Self {
        Self { positions }
    }

    /// The conventional layout for `channels` channels.
    pub fn default_for(channels: u8) -> Self {
        use ChannelPosition::*;

        let positions = match channels {
            1 => vec![Mono],
            2 => vec![FrontLeft, FrontRight],
            3 => vec![FrontLeft, FrontRight, FrontCenter],
            4 => vec![FrontLeft, FrontRight, RearLeft, RearRight],
            5 => vec![FrontLeft, FrontRight, FrontCenter, RearLeft, RearRight],
            6 => vec![FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight],
            8 => vec![FrontLeft, FrontRight, FrontCenter, Lfe, RearLeft, RearRight, SideLeft, SideRight],
            n => (0..n).map(Aux).collect(),
        };

        Self { positions }
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions
    }

    pub fn position_of(&self, pos: ChannelPosition) -> Option<usize> {
        self.positions.iter().position(|p| *p == pos)
    }
}

/// Linear per-channel gain, 1.0 being unity.
#[derive(Clone, Debug, PartialEq)]
pub struct ChannelVolumes {
    values: Vec<f32>,
}

impl ChannelVolumes {
    pub const NORM: f32 = 1.0;

    /// Unity gain on every channel.
    pub fn norm(channels: usize) -> Self {
        Self::uniform(channels, Self::NORM)
    }

    pub fn uniform(channels: usize, gain: f32) -> Self {
        Self { values: vec![gain; channels] }
    }

    pub fn from_values(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn channels(&self) -> usize {
        self.values.len()
    }

    pub fn average(&self) -> f32 {
        if self.values.is_empty() {
            return Self::NORM;
        }
        self.values.iter().sum::<f32>() / self.values.len() as f32
    }

    /// Re-express these volumes (laid out as `from`) for the layout `to`.
    ///
    /// Channels whose position exists in both maps keep their gain; the rest
    /// get the average gain of the source.
    pub fn remap(&self, from: &ChannelMap, to: &ChannelMap) -> ChannelVolumes {
        if from == to {
            return self.clone();
        }

        let avg = self.average();
        let values = to
            .positions()
            .iter()
            .map(|pos| {
                from.position_of(*pos)
                    .and_then(|i| self.values.get(i).copied())
                    .unwrap_or(avg)
            })
            .collect();

        ChannelVolumes { values }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_size_and_time_conversion() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 48_000, 2);
        assert_eq!(spec.frame_size(), 4);
        // 480 frames = 10ms
        assert_eq!(spec.bytes_to_usec(480 * 4), 10 * USEC_PER_MSEC);
        assert_eq!(spec.usec_to_bytes(10 * USEC_PER_MSEC), 480 * 4);
        // partial frames do not count
        assert_eq!(spec.bytes_to_usec(3), 0);
        assert_eq!(spec.frame_align(4 * 10 + 3), 40);
    }

    #[test]
    fn default_maps_match_channel_count() {
        for ch in 1..=8u8 {
            assert_eq!(ChannelMap::default_for(ch).channels(), ch as usize);
        }
    }

    #[test]
    fn remap_keeps_shared_positions() {
        let stereo = ChannelMap::default_for(2);
        let quad = ChannelMap::default_for(4);
        let vol = ChannelVolumes::from_values(vec![0.5, 1.0]);

        let remapped = vol.remap(&stereo, &quad);
        assert_eq!(remapped.values(), &[0.5, 1.0, 0.75, 0.75]);

        let back = remapped.remap(&quad, &stereo);
        assert_eq!(back.values(), &[0.5, 1.0]);
    }
}
