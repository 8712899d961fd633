//! Node configuration.
//!
//! Usually filled from module arguments; every field has a default so a
//! partial TOML table is enough:
//!
//! ```
//! use vsource::config::VirtualSourceConfig;
//!
//! let config: VirtualSourceConfig = toml::from_str(r#"
//!     source_name = "mic.denoise"
//!     source_type = "denoise"
//!     uplink_sink = "mic.denoise.uplink"
//! "#).unwrap();
//! assert!(config.remix);
//! ```

use serde::Deserialize;

use crate::endpoint::Properties;
use crate::error::VsourceError;
use crate::policy::DEFAULT_MAX_BLOCK_BYTES;
use crate::sample::{ChannelMap, SampleSpec, Usec};

/// Resampler the master uses for the attachment. Rates never differ between
/// the attachment and the public endpoint, so this only matters for the
/// master side of the attachment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResampleMethod {
    #[default]
    Auto,
    Trivial,
    SpeexFloat,
    SpeexFixed,
    Soxr,
    Copy,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VirtualSourceConfig {
    /// Public endpoint name. Defaults to `<master name>.<source type>`.
    pub source_name: Option<String>,
    pub source_type: String,
    /// Leading words of generated descriptions
    pub description_prefix: String,
    /// Fixed description; generated from the master when unset
    pub description: Option<String>,

    /// Format of the public endpoint. Defaults to the master's.
    pub sample_spec: Option<SampleSpec>,
    pub channel_map: Option<ChannelMap>,
    /// Format of the attachment to the master. Defaults to the public format.
    pub master_sample_spec: Option<SampleSpec>,
    pub master_channel_map: Option<ChannelMap>,

    pub use_volume_sharing: bool,
    pub force_flat_volume: bool,
    pub remix: bool,
    pub resample_method: ResampleMethod,

    /// Name of the uplink sink; no uplink when unset
    pub uplink_sink: Option<String>,
    /// Autoloaded nodes never move
    pub autoloaded: bool,

    pub max_latency_usec: Option<Usec>,
    /// Device block ceiling in bytes
    pub max_block_bytes: usize,

    pub source_properties: Properties,
    pub attachment_properties: Properties,
}

impl Default for VirtualSourceConfig {
    fn default() -> Self {
        Self {
            source_name: None,
            source_type: "unknown".to_owned(),
            description_prefix: "Unknown Source".to_owned(),
            description: None,
            sample_spec: None,
            channel_map: None,
            master_sample_spec: None,
            master_channel_map: None,
            use_volume_sharing: false,
            force_flat_volume: false,
            remix: true,
            resample_method: ResampleMethod::default(),
            uplink_sink: None,
            autoloaded: false,
            max_latency_usec: None,
            max_block_bytes: DEFAULT_MAX_BLOCK_BYTES,
            source_properties: Properties::new(),
            attachment_properties: Properties::new(),
        }
    }
}

impl VirtualSourceConfig {
    pub fn new(source_type: impl Into<String>, description_prefix: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            description_prefix: description_prefix.into(),
            ..Self::default()
        }
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_sample_spec(mut self, spec: SampleSpec) -> Self {
        self.sample_spec = Some(spec);
        self
    }

    pub fn with_channel_map(mut self, map: ChannelMap) -> Self {
        self.channel_map = Some(map);
        self
    }

    pub fn with_master_format(mut self, spec: SampleSpec, map: ChannelMap) -> Self {
        self.master_sample_spec = Some(spec);
        self.master_channel_map = Some(map);
        self
    }

    pub fn with_volume_sharing(mut self, enabled: bool) -> Self {
        self.use_volume_sharing = enabled;
        self
    }

    pub fn with_force_flat_volume(mut self, enabled: bool) -> Self {
        self.force_flat_volume = enabled;
        self
    }

    pub fn with_uplink_sink(mut self, name: impl Into<String>) -> Self {
        self.uplink_sink = Some(name.into());
        self
    }

    pub fn with_autoloaded(mut self, autoloaded: bool) -> Self {
        self.autoloaded = autoloaded;
        self
    }

    pub fn with_max_latency(mut self, usec: Usec) -> Self {
        self.max_latency_usec = Some(usec);
        self
    }

    pub fn with_max_block_bytes(mut self, bytes: usize) -> Self {
        self.max_block_bytes = bytes;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.source_properties.insert(key.into(), value.into());
        self
    }

    /// Checks that don't need the master.
    pub fn validate(&self) -> Result<(), VsourceError> {
        if self.use_volume_sharing && self.force_flat_volume {
            return Err(VsourceError::invalid_config("flat volume can't be forced when using volume sharing"));
        }
        if self.max_block_bytes == 0 {
            return Err(VsourceError::invalid_config("max_block_bytes must be nonzero"));
        }
        if self.source_type.is_empty() {
            return Err(VsourceError::invalid_config("source_type must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{ChannelPosition, SampleFormat};

    #[test]
    fn test_defaults() {
        let config = VirtualSourceConfig::default();
        assert_eq!(config.source_type, "unknown");
        assert_eq!(config.description_prefix, "Unknown Source");
        assert!(config.remix);
        assert_eq!(config.max_block_bytes, DEFAULT_MAX_BLOCK_BYTES);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_volume_sharing_with_flat_volume_is_rejected() {
        let config = VirtualSourceConfig::default()
            .with_volume_sharing(true)
            .with_force_flat_volume(true);
        assert!(matches!(config.validate(), Err(VsourceError::InvalidConfig(_))));
    }

    #[test]
    fn test_from_toml() {
        let config: VirtualSourceConfig = toml::from_str(
            r#"
            source_name = "mic.remap"
            source_type = "remap"
            description_prefix = "Remapped"
            autoloaded = true
            resample_method = "speex-float"
            max_latency_usec = 200000
            channel_map = ["front-left", "front-right"]

            [sample_spec]
            format = "s16le"
            rate = 44100
            channels = 2

            [source_properties]
            "device.icon_name" = "audio-input-microphone"
            "#,
        )
        .unwrap();

        assert_eq!(config.source_name.as_deref(), Some("mic.remap"));
        assert!(config.autoloaded);
        assert_eq!(config.resample_method, ResampleMethod::SpeexFloat);
        assert_eq!(config.max_latency_usec, Some(200_000));
        assert_eq!(config.sample_spec, Some(SampleSpec::new(SampleFormat::S16Le, 44_100, 2)));
        assert_eq!(
            config.channel_map.as_ref().map(|m| m.positions().to_vec()),
            Some(vec![ChannelPosition::FrontLeft, ChannelPosition::FrontRight])
        );
        assert_eq!(
            config.source_properties.get("device.icon_name").map(String::as_str),
            Some("audio-input-microphone")
        );
        // untouched fields keep their defaults
        assert!(config.remix);
        assert_eq!(config.uplink_sink, None);
    }
}
