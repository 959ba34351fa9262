//! Device configuration

use crate::channel::ChannelCapabilities;
use crate::error::{A429Error, Result};
use crate::memory::{MemorySizes, WordOrder};

/// Static description of one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelConfig {
    /// What the hardware behind the channel can do
    pub capabilities: ChannelCapabilities,
}

impl ChannelConfig {
    /// Bidirectional channel with fixed amplitude
    pub fn bidirectional() -> Self {
        ChannelConfig {
            capabilities: ChannelCapabilities::RECEIVE | ChannelCapabilities::TRANSMIT,
        }
    }

    /// Receive-only channel
    pub fn receive_only() -> Self {
        ChannelConfig {
            capabilities: ChannelCapabilities::RECEIVE,
        }
    }

    /// Transmit-only channel
    pub fn transmit_only() -> Self {
        ChannelConfig {
            capabilities: ChannelCapabilities::TRANSMIT,
        }
    }

    /// Same channel with a programmable output amplitude
    pub fn with_variable_amplitude(mut self) -> Self {
        self.capabilities |= ChannelCapabilities::VARIABLE_AMPLITUDE;
        self
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::bidirectional()
    }
}

/// Board configuration a [`crate::Device`] is built from
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceConfig {
    /// Board number, only used in logs
    pub board_id: u32,
    /// Channels 1..=N in order
    pub channels: Vec<ChannelConfig>,
    /// Global memory in bytes
    pub global_memory_size: u32,
    /// Shared memory in bytes
    pub shared_memory_size: u32,
    /// Local memory in bytes
    pub local_memory_size: u32,
    /// I/O space in bytes
    pub io_memory_size: u32,
    /// Layout of 32 bit values in board memory
    pub word_order: WordOrder,
    /// Number of external input trigger lines
    pub input_trigger_lines: u8,
    /// Number of external output trigger lines
    pub output_trigger_lines: u8,
    /// Monitor capacity in entries when a setup asks for the default
    pub default_monitor_size: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let sizes = MemorySizes::default();
        DeviceConfig {
            board_id: 0,
            channels: vec![ChannelConfig::bidirectional(); 8],
            global_memory_size: sizes.global,
            shared_memory_size: sizes.shared,
            local_memory_size: sizes.local,
            io_memory_size: sizes.io,
            word_order: WordOrder::default(),
            input_trigger_lines: crate::limits::MAX_TRIGGER_LINES,
            output_trigger_lines: crate::limits::MAX_TRIGGER_LINES,
            default_monitor_size: crate::limits::DEFAULT_MONITOR_ENTRIES,
        }
    }
}

impl DeviceConfig {
    /// Builder starting from the defaults
    pub fn builder() -> crate::device::DeviceBuilder {
        crate::device::DeviceBuilder::new()
    }

    /// Memory class sizes
    pub fn memory_sizes(&self) -> MemorySizes {
        MemorySizes {
            global: self.global_memory_size,
            shared: self.shared_memory_size,
            local: self.local_memory_size,
            io: self.io_memory_size,
        }
    }

    /// Bytes of global memory taken by the fixed channel descriptors
    pub fn descriptor_area(&self) -> u32 {
        self.channels.len() as u32 * crate::limits::CHANNEL_DESCRIPTOR_BYTES
    }

    pub fn validate(&self) -> Result<()> {
        let max = usize::from(crate::limits::MAX_CHANNELS);
        if self.channels.is_empty() || self.channels.len() > max {
            return Err(A429Error::invalid_channel(format!(
                "Board {} with {} channels, expected 1..={}",
                self.board_id,
                self.channels.len(),
                max
            )));
        }
        if self.shared_memory_size == 0 || self.local_memory_size == 0 || self.io_memory_size == 0 {
            return Err(A429Error::invalid_size("Memory classes must not be empty"));
        }
        if self.global_memory_size <= self.descriptor_area() {
            return Err(A429Error::invalid_size(format!(
                "Global memory of {} bytes leaves no room after {} bytes of channel descriptors",
                self.global_memory_size,
                self.descriptor_area()
            )));
        }
        let lines = crate::limits::MAX_TRIGGER_LINES;
        if self.input_trigger_lines > lines || self.output_trigger_lines > lines {
            return Err(A429Error::parameter_range(format!(
                "Trigger line counts {}/{} exceed {}",
                self.input_trigger_lines, self.output_trigger_lines, lines
            )));
        }
        let granule = crate::limits::MONITOR_SIZE_GRANULE;
        if self.default_monitor_size == 0 || self.default_monitor_size % granule != 0 {
            return Err(A429Error::invalid_size(format!(
                "Default monitor size {} is not a multiple of {}",
                self.default_monitor_size, granule
            )));
        }
        Ok(())
    }

    /// Parse a configuration from JSON
    #[cfg(feature = "serde")]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: DeviceConfig = serde_json::from_str(json)
            .map_err(|e| A429Error::parameter_range(format!("Invalid device configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration as JSON
    #[cfg(feature = "serde")]
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| A429Error::internal(format!("Device configuration not serializable: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() -> Result<()> {
        let config = DeviceConfig::default();
        config.validate()?;
        assert_eq!(config.descriptor_area(), 8 * 64);
        assert_eq!(config.memory_sizes(), MemorySizes::default());
        Ok(())
    }

    #[rstest]
    #[case(0, false)]
    #[case(1, true)]
    #[case(32, true)]
    #[case(33, false)]
    fn test_channel_count(#[case] count: usize, #[case] valid: bool) {
        let config = DeviceConfig {
            channels: vec![ChannelConfig::default(); count],
            ..DeviceConfig::default()
        };
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[test]
    fn test_rejects_bad_limits() {
        let config = DeviceConfig {
            output_trigger_lines: 5,
            ..DeviceConfig::default()
        };
        assert!(config.validate().is_err());
        let config = DeviceConfig {
            default_monitor_size: 1000,
            ..DeviceConfig::default()
        };
        assert!(config.validate().is_err());
        let config = DeviceConfig {
            global_memory_size: 256,
            ..DeviceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_channel_presets() {
        assert!(!ChannelConfig::receive_only().capabilities.contains(ChannelCapabilities::TRANSMIT));
        assert!(ChannelConfig::transmit_only()
            .with_variable_amplitude()
            .capabilities
            .contains(ChannelCapabilities::VARIABLE_AMPLITUDE));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_json_round_trip() -> Result<()> {
        let config = DeviceConfig {
            board_id: 3,
            channels: vec![ChannelConfig::receive_only(), ChannelConfig::transmit_only()],
            word_order: WordOrder::Big,
            ..DeviceConfig::default()
        };
        let parsed = DeviceConfig::from_json(&config.to_json()?)?;
        assert_eq!(parsed, config);
        assert!(DeviceConfig::from_json("{\"channels\": []}").is_err());
        Ok(())
    }
}
