use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter};

pub const LEVEL_COUNT: usize = MemoryLevel::COUNT;

/// On-chip buffer tiers, slowest first.
#[derive(
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Debug,
    Copy,
    Clone,
    Hash,
    Deserialize,
    Serialize,
    EnumIter,
    EnumCount,
    strum::Display,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum MemoryLevel {
    L1,
    L0A,
    L0B,
    L0C,
}

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum TargetId {
    Edge,
    Standard,
    #[default]
    Datacenter,
}

/// Multipliers applied to weight traffic depending on how the weight is fetched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BandwidthCoeffs {
    /// Contiguous fetches.
    pub unit: u64,
    /// Channel-first fmap with an unblocked weight; every fractal is a strided gather.
    pub strided: u64,
    /// Small-channel NHWC.
    pub small_channel: u64,
}

/// Hardware instruction limits that bound tile shapes independently of buffer capacity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct InstructionLimits {
    /// Longest transfer one descriptor may describe, in elements of the reduction axis.
    pub max_transfer_len: u64,
    /// Widest input row the merged-spatial load can window over.
    pub max_load_width: u64,
    /// Largest reduction extent (after the kernel window) a single load may cover.
    pub post_k_limit: u64,
    /// Largest M offset a load may start from.
    pub m_start_limit: u64,
    /// Longest single burst of bias or scale parameters, in bytes.
    pub max_burst_bytes: u64,
}

/// Everything the search knows about a device.
///
/// Capacities are bytes. `bandwidth` is bytes moved per modeled cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct HardwareBudget {
    pub cores: u32,
    pub l1_bytes: u64,
    pub l0a_bytes: u64,
    pub l0b_bytes: u64,
    pub l0c_bytes: u64,
    pub bandwidth: u64,
    pub bandwidth_coeffs: BandwidthCoeffs,
    /// How much more it costs to stream a weight byte into L1 than an fmap byte.
    pub weight_l1_bandwidth_ratio: u64,
    pub limits: InstructionLimits,
}

const DEFAULT_COEFFS: BandwidthCoeffs = BandwidthCoeffs {
    unit: 1,
    strided: 4,
    small_channel: 2,
};

const DEFAULT_LIMITS: InstructionLimits = InstructionLimits {
    max_transfer_len: 65_535,
    max_load_width: 32_767,
    post_k_limit: 65_535,
    m_start_limit: 32_767,
    max_burst_bytes: 65_535,
};

impl HardwareBudget {
    pub const fn for_target(target: TargetId) -> Self {
        match target {
            TargetId::Edge => HardwareBudget {
                cores: 8,
                l1_bytes: 524_288,
                l0a_bytes: 65_536,
                l0b_bytes: 65_536,
                l0c_bytes: 131_072,
                bandwidth: 64,
                bandwidth_coeffs: DEFAULT_COEFFS,
                weight_l1_bandwidth_ratio: 2,
                limits: DEFAULT_LIMITS,
            },
            TargetId::Standard => HardwareBudget {
                cores: 24,
                l1_bytes: 524_288,
                l0a_bytes: 65_536,
                l0b_bytes: 65_536,
                l0c_bytes: 262_144,
                bandwidth: 128,
                bandwidth_coeffs: DEFAULT_COEFFS,
                weight_l1_bandwidth_ratio: 2,
                limits: DEFAULT_LIMITS,
            },
            TargetId::Datacenter => HardwareBudget {
                cores: 32,
                l1_bytes: 524_288,
                l0a_bytes: 65_536,
                l0b_bytes: 65_536,
                l0c_bytes: 262_144,
                bandwidth: 128,
                bandwidth_coeffs: DEFAULT_COEFFS,
                weight_l1_bandwidth_ratio: 2,
                limits: DEFAULT_LIMITS,
            },
        }
    }

    pub fn with_cores(mut self, cores: u32) -> Self {
        self.cores = cores;
        self
    }

    pub fn with_capacity(mut self, level: MemoryLevel, bytes: u64) -> Self {
        match level {
            MemoryLevel::L1 => self.l1_bytes = bytes,
            MemoryLevel::L0A => self.l0a_bytes = bytes,
            MemoryLevel::L0B => self.l0b_bytes = bytes,
            MemoryLevel::L0C => self.l0c_bytes = bytes,
        }
        self
    }

    pub fn capacity(&self, level: MemoryLevel) -> u64 {
        match level {
            MemoryLevel::L1 => self.l1_bytes,
            MemoryLevel::L0A => self.l0a_bytes,
            MemoryLevel::L0B => self.l0b_bytes,
            MemoryLevel::L0C => self.l0c_bytes,
        }
    }

    /// Elements of `dtype_bytes` that make up one efficient transfer.
    pub fn min_burst(&self, dtype_bytes: u64) -> u64 {
        self.bandwidth / dtype_bytes.max(1)
    }
}

impl Default for HardwareBudget {
    fn default() -> Self {
        HardwareBudget::for_target(TargetId::default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use proptest::prelude::*;
    use strum::IntoEnumIterator;

    /// Default-target budgets with every buffer tier shrunk to somewhere around its
    /// minimal-tile footprint.
    pub(crate) fn arb_budget() -> impl Strategy<Value = HardwareBudget> {
        (1u64..1 << 18, 256u64..1 << 17, 256u64..1 << 17, 1024u64..1 << 19).prop_map(
            |(l1, l0a, l0b, l0c)| {
                HardwareBudget::default()
                    .with_capacity(MemoryLevel::L1, l1)
                    .with_capacity(MemoryLevel::L0A, l0a)
                    .with_capacity(MemoryLevel::L0B, l0b)
                    .with_capacity(MemoryLevel::L0C, l0c)
            },
        )
    }

    #[test]
    fn test_levels_are_ordered_slowest_first() {
        assert_eq!(
            MemoryLevel::iter().collect::<Vec<_>>(),
            vec![
                MemoryLevel::L1,
                MemoryLevel::L0A,
                MemoryLevel::L0B,
                MemoryLevel::L0C
            ]
        );
        assert_eq!(LEVEL_COUNT, 4);
    }

    #[test]
    fn test_min_burst() {
        let budget = HardwareBudget::for_target(TargetId::Datacenter);
        assert_eq!(budget.min_burst(2), 64);
        assert_eq!(budget.min_burst(1), 128);
    }

    proptest! {
        #[test]
        fn test_with_capacity_sets_only_that_level(level in any::<MemoryLevel>(), bytes in 0u64..1 << 24) {
            let before = HardwareBudget::default();
            let after = before.with_capacity(level, bytes);
            for l in MemoryLevel::iter() {
                if l == level {
                    prop_assert_eq!(after.capacity(l), bytes);
                } else {
                    prop_assert_eq!(after.capacity(l), before.capacity(l));
                }
            }
        }
    }
}
