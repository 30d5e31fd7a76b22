//! Transmitter configuration: the immutable parameter set an
//! [`crate::transmitter::Transmitter`] is initialized with, plus the
//! Apple-style preset associated functions.

use fwa_core::nub::BusSpeed;
use fwa_core::{Result, TransmitError};
use serde::Deserialize;

/// `NonBlocking` leaves SYT generation as a placeholder that never advances
/// a real timing reference; `Blocking` implements the rate-exact
/// NO-DATA/DATA pattern the pre-calculator is built around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum TransmissionType {
    NonBlocking,
    Blocking,
}

impl Default for TransmissionType {
    fn default() -> Self {
        TransmissionType::Blocking
    }
}

/// Which SYT-decision algorithm the pre-calculator uses when
/// `transmission_type == Blocking`. Both are real, independently tested
/// implementations rather than one being a stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum SytStyle {
    /// The deterministic per-rate phase rule (44.1 kHz Bresenham-ish phase
    /// counter, 48 kHz fixed-interval rule).
    Phase,
    /// The Apple-style DDA/ideal-data-time generator.
    AppleDda,
}

impl Default for SytStyle {
    fn default() -> Self {
        SytStyle::Phase
    }
}

fn default_bus_speed() -> BusSpeedConfig {
    BusSpeedConfig::S400
}

/// Serde-friendly mirror of [`fwa_core::nub::BusSpeed`] (which has no
/// `Deserialize` impl since it lives in the hardware-boundary crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum BusSpeedConfig {
    S100,
    S200,
    S400,
    S800,
}

impl From<BusSpeedConfig> for BusSpeed {
    fn from(v: BusSpeedConfig) -> Self {
        match v {
            BusSpeedConfig::S100 => BusSpeed::S100,
            BusSpeedConfig::S200 => BusSpeed::S200,
            BusSpeedConfig::S400 => BusSpeed::S400,
            BusSpeedConfig::S800 => BusSpeed::S800,
        }
    }
}

/// Sentinel channel value meaning "any available channel".
pub const ANY_CHANNEL: u32 = fwa_core::nub::ANY_CHANNEL;

/// Immutable transmitter configuration.
///
/// Validity (checked by [`TransmitConfig::validate`]): no field is zero,
/// `callback_group_interval` divides `num_groups`, and
/// `num_groups >= 3 * callback_group_interval`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransmitConfig {
    pub num_groups: u32,
    pub packets_per_group: u32,
    pub callback_group_interval: u32,
    pub packet_data_size: u32,
    pub client_buffer_size: u32,
    pub num_channels: u32,
    pub sample_rate: u32,
    pub initial_speed: BusSpeedConfig,
    pub initial_channel: u32,
    pub transmission_type: TransmissionType,
    pub syt_style: SytStyle,
}

impl Default for TransmitConfig {
    fn default() -> Self {
        TransmitConfig {
            num_groups: 100,
            packets_per_group: 8,
            callback_group_interval: 20,
            packet_data_size: 64,
            client_buffer_size: 4096,
            num_channels: 2,
            sample_rate: 44_100,
            initial_speed: default_bus_speed(),
            initial_channel: ANY_CHANNEL,
            transmission_type: TransmissionType::Blocking,
            syt_style: SytStyle::Phase,
        }
    }
}

impl TransmitConfig {
    /// 100 groups, callback every 20: the baseline ring depth.
    pub fn classic() -> Self {
        TransmitConfig {
            num_groups: 100,
            callback_group_interval: 20,
            ..Default::default()
        }
    }

    /// Deeper ring, same callback cadence, for hosts with looser scheduling.
    pub fn conservative() -> Self {
        TransmitConfig {
            num_groups: 160,
            callback_group_interval: 20,
            ..Default::default()
        }
    }

    /// The shallowest ring that still satisfies
    /// the `num_groups >= 3 * callback_group_interval` rule.
    pub fn minimal() -> Self {
        TransmitConfig {
            num_groups: 60,
            callback_group_interval: 20,
            ..Default::default()
        }
    }

    /// Total number of DCL descriptors (`num_groups * packets_per_group`).
    pub fn total_packets(&self) -> u32 {
        self.num_groups * self.packets_per_group
    }

    /// Expected wall-clock interval between DCL completion callbacks, in
    /// milliseconds (125 µs per cycle, one packet per cycle).
    pub fn callback_interval_ms(&self) -> u32 {
        self.callback_group_interval * self.packets_per_group * 125 / 1000
    }

    /// Check the validity rules above. Returns `BadArgument` describing the
    /// first violated rule.
    pub fn validate(&self) -> Result<()> {
        if self.num_groups == 0
            || self.packets_per_group == 0
            || self.callback_group_interval == 0
            || self.packet_data_size == 0
            || self.client_buffer_size == 0
            || self.num_channels == 0
            || self.sample_rate == 0
        {
            return Err(TransmitError::BadArgument(
                "no configuration field may be zero".into(),
            ));
        }
        if self.num_groups % self.callback_group_interval != 0 {
            return Err(TransmitError::BadArgument(
                "callback_group_interval must divide num_groups".into(),
            ));
        }
        if self.num_groups < 3 * self.callback_group_interval {
            return Err(TransmitError::BadArgument(
                "num_groups must be at least 3x callback_group_interval".into(),
            ));
        }
        if fwa_core::cip::fdf_for_sample_rate(self.sample_rate).is_none() {
            return Err(TransmitError::Unsupported(format!(
                "unsupported sample rate: {}",
                self.sample_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        TransmitConfig::default().validate().unwrap();
    }

    #[test]
    fn presets_are_valid() {
        TransmitConfig::classic().validate().unwrap();
        TransmitConfig::conservative().validate().unwrap();
        TransmitConfig::minimal().validate().unwrap();
    }

    #[test]
    fn rejects_zero_fields() {
        let mut cfg = TransmitConfig::default();
        cfg.packets_per_group = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_non_dividing_interval() {
        let mut cfg = TransmitConfig::default();
        cfg.num_groups = 101;
        cfg.callback_group_interval = 20;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_too_shallow_ring() {
        let mut cfg = TransmitConfig::default();
        cfg.num_groups = 40;
        cfg.callback_group_interval = 20;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_sample_rate() {
        let mut cfg = TransmitConfig::default();
        cfg.sample_rate = 22_050;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_from_json_with_defaults() {
        let cfg: TransmitConfig = serde_json::from_str(r#"{"sample_rate": 48000}"#).unwrap();
        assert_eq!(cfg.sample_rate, 48_000);
        assert_eq!(cfg.num_groups, 100);
        cfg.validate().unwrap();
    }
}
