//! Recognized configuration options of the causal logging core.
//!
//! The in-flight record logger is a collaborator of this crate, not part
//! of it, but its options are recognized and validated here so that one
//! options map can configure the whole failover stack.

use crate::causal::error::*;

/// How many hops upstream a determinant is propagated along the
/// dataflow graph. `-1` means no limit, `0` means nothing is shared
/// downstream.
pub const KEY_SHARING_DEPTH: &str = "causal.sharing_depth";

/// Selects the in-flight record logger variant.
pub const KEY_INFLIGHT_TYPE: &str = "inflight.type";

/// Spill trigger for in-flight records.
pub const KEY_INFLIGHT_SPILL_POLICY: &str = "inflight.spill.policy";

/// Buffer availability fraction triggering a spill, for the
/// `availability` policy.
pub const KEY_INFLIGHT_SPILL_AVAILABILITY_TRIGGER: &str = "inflight.spill.availability_trigger";

/// Read side buffer reservation of the in-flight spiller.
pub const KEY_INFLIGHT_SPILL_NUM_RECOVERY_BUFFERS: &str = "inflight.spill.num_recovery_buffers";

/// Poll interval of the in-flight spill policy, in milliseconds.
pub const KEY_INFLIGHT_SPILL_SLEEP_MS: &str = "inflight.spill.sleep_ms";

/// Variants of the in-flight record logger collaborator.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum InflightLogType {
    InMemory,
    Spillable,
}

/// Spill triggers of the spillable in-flight record logger.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SpillPolicy {
    Eager,
    Availability,
    Epoch,
}

/// Options of the spillable in-flight record logger.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SpillConfig {
    pub policy: SpillPolicy,
    pub availability_trigger: f64,
    pub num_recovery_buffers: u32,
    pub sleep_ms: u64,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            policy: SpillPolicy::Eager,
            availability_trigger: 0.3,
            num_recovery_buffers: 50,
            sleep_ms: 50,
        }
    }
}

/// The recognized options of the causal logging core, with their
/// defaults.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct CausalConfig {
    /// Determinant sharing depth `d`; `-1` is unbounded.
    pub sharing_depth: i32,
    /// Selected in-flight record logger variant.
    pub inflight_type: InflightLogType,
    /// Options forwarded to the spillable in-flight logger.
    pub spill: SpillConfig,
}

impl Default for CausalConfig {
    fn default() -> Self {
        Self {
            sharing_depth: 1,
            inflight_type: InflightLogType::Spillable,
            spill: SpillConfig::default(),
        }
    }
}

impl CausalConfig {
    /// Builds a configuration from string options, starting from the
    /// defaults. Keys this crate does not recognize are left for other
    /// subsystems to interpret.
    pub fn from_options<'a, I>(options: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = Self::default();
        for (key, value) in options {
            match key {
                KEY_SHARING_DEPTH => {
                    let depth: i32 = value
                        .parse()
                        .wrapped_msg(ErrorKind::Config, KEY_SHARING_DEPTH)?;
                    if depth < -1 {
                        return Err("Sharing depth below -1").wrapped(ErrorKind::Config);
                    }
                    config.sharing_depth = depth;
                }
                KEY_INFLIGHT_TYPE => {
                    config.inflight_type = match value {
                        "in_memory" => InflightLogType::InMemory,
                        "spillable" => InflightLogType::Spillable,
                        _ => {
                            return Err("Unknown in-flight log type").wrapped(ErrorKind::Config);
                        }
                    };
                }
                KEY_INFLIGHT_SPILL_POLICY => {
                    config.spill.policy = match value {
                        "eager" => SpillPolicy::Eager,
                        "availability" => SpillPolicy::Availability,
                        "epoch" => SpillPolicy::Epoch,
                        _ => {
                            return Err("Unknown spill policy").wrapped(ErrorKind::Config);
                        }
                    };
                }
                KEY_INFLIGHT_SPILL_AVAILABILITY_TRIGGER => {
                    let trigger: f64 = value
                        .parse()
                        .wrapped_msg(ErrorKind::Config, KEY_INFLIGHT_SPILL_AVAILABILITY_TRIGGER)?;
                    if !(0.0..=1.0).contains(&trigger) {
                        return Err("Availability trigger outside [0, 1]")
                            .wrapped(ErrorKind::Config);
                    }
                    config.spill.availability_trigger = trigger;
                }
                KEY_INFLIGHT_SPILL_NUM_RECOVERY_BUFFERS => {
                    let n: u32 = value
                        .parse()
                        .wrapped_msg(ErrorKind::Config, KEY_INFLIGHT_SPILL_NUM_RECOVERY_BUFFERS)?;
                    if n < 1 {
                        return Err("Recovery buffer count below 1").wrapped(ErrorKind::Config);
                    }
                    config.spill.num_recovery_buffers = n;
                }
                KEY_INFLIGHT_SPILL_SLEEP_MS => {
                    config.spill.sleep_ms = value
                        .parse()
                        .wrapped_msg(ErrorKind::Config, KEY_INFLIGHT_SPILL_SLEEP_MS)?;
                }
                _ => (),
            }
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_recognized_options_table() {
        let config = CausalConfig::default();
        assert_eq!(config.sharing_depth, 1);
        assert_eq!(config.inflight_type, InflightLogType::Spillable);
        assert_eq!(config.spill.policy, SpillPolicy::Eager);
        assert_eq!(config.spill.availability_trigger, 0.3);
        assert_eq!(config.spill.num_recovery_buffers, 50);
        assert_eq!(config.spill.sleep_ms, 50);
    }

    #[test]
    fn parses_recognized_options() {
        let config = CausalConfig::from_options(vec![
            ("causal.sharing_depth", "-1"),
            ("inflight.type", "in_memory"),
            ("inflight.spill.policy", "availability"),
            ("inflight.spill.availability_trigger", "0.5"),
            ("inflight.spill.num_recovery_buffers", "8"),
            ("inflight.spill.sleep_ms", "100"),
            ("unrelated.key", "whatever"),
        ])
        .unwrap();
        assert_eq!(config.sharing_depth, -1);
        assert_eq!(config.inflight_type, InflightLogType::InMemory);
        assert_eq!(config.spill.policy, SpillPolicy::Availability);
        assert_eq!(config.spill.availability_trigger, 0.5);
        assert_eq!(config.spill.num_recovery_buffers, 8);
        assert_eq!(config.spill.sleep_ms, 100);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let depth = CausalConfig::from_options(vec![("causal.sharing_depth", "-2")]);
        assert_eq!(depth.unwrap_err().kind(), ErrorKind::Config);

        let trigger = CausalConfig::from_options(vec![(
            "inflight.spill.availability_trigger",
            "1.5",
        )]);
        assert_eq!(trigger.unwrap_err().kind(), ErrorKind::Config);

        let buffers = CausalConfig::from_options(vec![(
            "inflight.spill.num_recovery_buffers",
            "0",
        )]);
        assert_eq!(buffers.unwrap_err().kind(), ErrorKind::Config);

        let policy = CausalConfig::from_options(vec![("inflight.spill.policy", "lazy")]);
        assert_eq!(policy.unwrap_err().kind(), ErrorKind::Config);
    }
}
