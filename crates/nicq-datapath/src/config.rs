//! Data path configuration
//!
//! Ring geometry, group sizing and data-path policy knobs. Loaded from
//! JSON or built from [`DatapathConfig::default`].

use crate::error::{DatapathError, DatapathResult};
use serde::{Deserialize, Serialize};

/// Which completion traffic an event queue may carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EqKind {
    /// General purpose, serves RX and TX
    Any,
    /// RX completions only
    Rx,
    /// TX completions only
    Tx,
}

impl EqKind {
    /// Whether this event queue can serve `rings`
    pub fn serves(self, rings: EqKind) -> bool {
        self == EqKind::Any || self == rings
    }
}

/// Data path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatapathConfig {
    /// log2 of send queue entries
    pub sq_size_shift: u32,
    /// log2 of receive queue entries
    pub rq_size_shift: u32,
    /// log2 of completion queue entries
    pub cq_size_shift: u32,
    /// Number of large RX groups
    pub rx_ngroups_large: usize,
    /// Number of small RX groups
    pub rx_ngroups_small: usize,
    /// Rings in each large RX group
    pub rx_nrings_per_large_group: usize,
    /// Rings in each small RX group
    pub rx_nrings_per_small_group: usize,
    /// Number of TX groups
    pub tx_ngroups: usize,
    /// Rings in each TX group
    pub tx_nrings_per_group: usize,
    /// Minimum packet size still loaned once the first loan watermark is hit
    pub rx_p50_loan_min_size: usize,
    /// Fragments at or above this size are bound instead of copied on TX
    pub tx_bind_threshold: usize,
    /// Doorbell write retries on a transient fault
    pub doorbell_tries: u32,
    /// log2 of entries in each group's VLAN flow table
    pub ftbl_vlan_size_shift: u32,
    /// log2 of entries in the port root flow table
    pub ftbl_root_size_shift: u32,
    /// Port MTU (packet buffer size)
    pub mtu: usize,
    /// Buffers moved per refill step
    pub refill_step: usize,
    /// Scatter pointers per receive descriptor
    pub recvq_max_ptrs: usize,
    /// CQ moderation period
    pub cqemod_period_usec: u32,
    /// CQ moderation count
    pub cqemod_count: u32,
    /// Completion event queues, by kind, in interrupt vector order
    pub event_queues: Vec<EqKind>,
    /// Upper bound on waiting for loaned buffers during shard drain
    pub loaned_drain_timeout_ms: u64,
}

impl Default for DatapathConfig {
    fn default() -> Self {
        Self {
            sq_size_shift: 11,
            rq_size_shift: 10,
            cq_size_shift: 10,
            rx_ngroups_large: 1,
            rx_ngroups_small: 0,
            rx_nrings_per_large_group: 8,
            rx_nrings_per_small_group: 4,
            tx_ngroups: 1,
            tx_nrings_per_group: 8,
            rx_p50_loan_min_size: 256,
            tx_bind_threshold: 2048,
            doorbell_tries: 3,
            ftbl_vlan_size_shift: 4,
            ftbl_root_size_shift: 6,
            mtu: 1518,
            refill_step: 64,
            recvq_max_ptrs: 4,
            cqemod_period_usec: 50,
            cqemod_count: 819,
            event_queues: vec![EqKind::Any; 4],
            loaned_drain_timeout_ms: 5000,
        }
    }
}

impl DatapathConfig {
    /// Load from a JSON file
    pub fn load(path: &str) -> DatapathResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse from a JSON string and validate
    pub fn from_json(json: &str) -> DatapathResult<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DatapathError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Send queue entries
    pub fn sq_entries(&self) -> usize {
        1 << self.sq_size_shift
    }

    /// Receive queue entries
    pub fn rq_entries(&self) -> usize {
        1 << self.rq_size_shift
    }

    /// Total RX groups
    pub fn rx_ngroups(&self) -> usize {
        self.rx_ngroups_large + self.rx_ngroups_small
    }

    /// Rings in RX group `index`
    pub fn rx_rings_in_group(&self, index: usize) -> usize {
        if index < self.rx_ngroups_large {
            self.rx_nrings_per_large_group
        } else {
            self.rx_nrings_per_small_group
        }
    }

    /// Check the configuration for values the data path cannot run with
    pub fn validate(&self) -> DatapathResult<()> {
        for (name, shift) in [
            ("sq_size_shift", self.sq_size_shift),
            ("rq_size_shift", self.rq_size_shift),
            ("cq_size_shift", self.cq_size_shift),
            ("ftbl_vlan_size_shift", self.ftbl_vlan_size_shift),
            ("ftbl_root_size_shift", self.ftbl_root_size_shift),
        ] {
            if !(2..=16).contains(&shift) {
                return Err(DatapathError::Config(format!(
                    "{name} must be within 2..=16, got {shift}"
                )));
            }
        }
        if self.refill_step == 0 || self.refill_step * 2 >= self.rq_entries() {
            return Err(DatapathError::Config(format!(
                "refill_step {} must be non-zero and below half the receive ring ({})",
                self.refill_step,
                self.rq_entries()
            )));
        }
        if self.rx_ngroups() == 0 || self.tx_ngroups == 0 {
            return Err(DatapathError::Config("at least one RX and one TX group required".into()));
        }
        if (self.rx_ngroups_large > 0 && self.rx_nrings_per_large_group == 0)
            || (self.rx_ngroups_small > 0 && self.rx_nrings_per_small_group == 0)
            || self.tx_nrings_per_group == 0
        {
            return Err(DatapathError::Config("ring groups must contain at least one ring".into()));
        }
        if self.recvq_max_ptrs == 0 {
            return Err(DatapathError::Config("recvq_max_ptrs must be non-zero".into()));
        }
        if self.event_queues.is_empty() {
            return Err(DatapathError::Config("no completion event queues".into()));
        }
        if !self.event_queues.iter().any(|k| k.serves(EqKind::Rx)) {
            return Err(DatapathError::Config("no event queue can serve RX rings".into()));
        }
        if !self.event_queues.iter().any(|k| k.serves(EqKind::Tx)) {
            return Err(DatapathError::Config("no event queue can serve TX rings".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = DatapathConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rq_entries(), 1024);
        assert_eq!(config.sq_entries(), 2048);
    }

    #[test]
    fn test_from_json_partial() {
        let config = DatapathConfig::from_json(
            r#"{ "rq_size_shift": 8, "event_queues": ["rx", "tx"] }"#,
        )
        .unwrap();
        assert_eq!(config.rq_entries(), 256);
        assert_eq!(config.event_queues, vec![EqKind::Rx, EqKind::Tx]);
        assert_eq!(config.refill_step, 64);
    }

    #[test]
    fn test_rejects_oversized_refill_step() {
        let config = DatapathConfig {
            rq_size_shift: 7,
            refill_step: 64,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(DatapathError::Config(_))));
    }

    #[test]
    fn test_rejects_missing_tx_eq() {
        let config = DatapathConfig {
            event_queues: vec![EqKind::Rx],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_group_sizing() {
        let config = DatapathConfig {
            rx_ngroups_large: 1,
            rx_ngroups_small: 2,
            rx_nrings_per_large_group: 8,
            rx_nrings_per_small_group: 2,
            ..Default::default()
        };
        assert_eq!(config.rx_ngroups(), 3);
        assert_eq!(config.rx_rings_in_group(0), 8);
        assert_eq!(config.rx_rings_in_group(2), 2);
    }
}
