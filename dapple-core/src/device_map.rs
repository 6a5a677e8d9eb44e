use candle_core::Device;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Number of attention heads processed per slice when slicing is enabled.
///
/// Head counts differ between UNet blocks, so only a slice size that divides
/// all of them is safe.
pub const ATTENTION_SLICE_SIZE: usize = 1;

/// Whether the UNet computes attention one slice at a time. Slicing trades
/// speed for a lower peak memory footprint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttentionSlicing {
    /// Slice on accelerators, run full attention on CPU.
    #[default]
    Auto,
    On,
    Off,
}

serde_plain::derive_display_from_serialize!(AttentionSlicing);
serde_plain::derive_fromstr_from_deserialize!(AttentionSlicing);

impl AttentionSlicing {
    pub fn slice_size(self, device: &Device) -> Option<usize> {
        match self {
            Self::On => Some(ATTENTION_SLICE_SIZE),
            Self::Off => None,
            Self::Auto if device.is_cpu() => None,
            Self::Auto => Some(ATTENTION_SLICE_SIZE),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_slicing_skips_cpu() {
        assert_eq!(AttentionSlicing::Auto.slice_size(&Device::Cpu), None);
        assert_eq!(AttentionSlicing::On.slice_size(&Device::Cpu), Some(ATTENTION_SLICE_SIZE));
        assert_eq!(AttentionSlicing::Off.slice_size(&Device::Cpu), None);
    }

    #[test]
    fn slicing_parses_from_config_strings() {
        assert_eq!("auto".parse::<AttentionSlicing>().unwrap(), AttentionSlicing::Auto);
        assert_eq!("off".parse::<AttentionSlicing>().unwrap(), AttentionSlicing::Off);
        assert!("sometimes".parse::<AttentionSlicing>().is_err());
        assert_eq!(AttentionSlicing::On.to_string(), "on");
    }
}
