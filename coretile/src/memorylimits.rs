use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::ops::{Add, Index, IndexMut};
use strum::IntoEnumIterator;

use crate::blocking::Axis;
use crate::common::{Dtype, C04_CIN, C0_BYTES, MAD_BYTES, SCALE_PARAM_BYTES};
use crate::layout::SplitLayout;
use crate::problem::{ConvDims, FmapFormat};
use crate::target::{HardwareBudget, MemoryLevel, LEVEL_COUNT};
use crate::utils::{align_up, ceil_div};

const MAX_40_BIT: u64 = (1 << 40) - 1;
const MAX_32_BIT: u64 = u32::MAX as u64;

/// Bytes resident in each buffer tier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MemoryFootprint([u64; LEVEL_COUNT]);

/// Why a layout cannot be used for a problem.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
pub enum Rejection {
    #[error("minimal tile needs {required} bytes of {level}, which holds {capacity}")]
    Capacity {
        level: MemoryLevel,
        required: u64,
        capacity: u64,
    },
    #[error("{what} is {value}, over the instruction limit of {limit}")]
    InstructionLimit {
        what: &'static str,
        value: u64,
        limit: u64,
    },
    #[error("no candidate {axis:?} split exists")]
    EmptyRange { axis: Axis },
    #[error("no candidate blocking has a computable cost")]
    NotComputable,
}

impl MemoryFootprint {
    pub fn zero() -> Self {
        MemoryFootprint([0; LEVEL_COUNT])
    }

    /// The first tier, slowest first, whose footprint exceeds `budget`.
    pub fn first_overflow(&self, budget: &HardwareBudget) -> Option<MemoryLevel> {
        MemoryLevel::iter().find(|&level| self[level] > budget.capacity(level))
    }

    pub fn iter(&self) -> impl Iterator<Item = (MemoryLevel, u64)> + '_ {
        MemoryLevel::iter().map(|level| (level, self[level]))
    }
}

impl Index<MemoryLevel> for MemoryFootprint {
    type Output = u64;

    fn index(&self, level: MemoryLevel) -> &Self::Output {
        &self.0[level as usize]
    }
}

impl IndexMut<MemoryLevel> for MemoryFootprint {
    fn index_mut(&mut self, level: MemoryLevel) -> &mut Self::Output {
        &mut self.0[level as usize]
    }
}

impl Add for MemoryFootprint {
    type Output = MemoryFootprint;

    fn add(mut self, rhs: Self) -> Self::Output {
        for level in MemoryLevel::iter() {
            self[level] = self[level].saturating_add(rhs[level]);
        }
        self
    }
}

impl Display for MemoryFootprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.iter()
                .map(|(level, bytes)| format!("{level}: {bytes}"))
                .join(", ")
        )
    }
}

/// Checks that every tier of `footprint` fits in `budget`, naming the first that does not.
pub fn fits(footprint: &MemoryFootprint, budget: &HardwareBudget) -> Result<(), Rejection> {
    match footprint.first_overflow(budget) {
        None => Ok(()),
        Some(level) => Err(Rejection::Capacity {
            level,
            required: footprint[level],
            capacity: budget.capacity(level),
        }),
    }
}

/// Per-channel bias and scale parameters are not staged in L1 for
/// unquantized int8 NCDHW problems.
fn skips_scale_bias(dims: &ConvDims) -> bool {
    dims.fmap_format == FmapFormat::Ncdhw
        && dims.fmap_dtype == Dtype::Int8
        && dims.channel_wise_coeff == 0
}

/// Bytes of bias and fixpipe parameters staged in L1 for `n` output channels.
pub(crate) fn channel_params_bytes(dims: &ConvDims, n: u64) -> Option<(u64, u64)> {
    if skips_scale_bias(dims) {
        return Some((0, 0));
    }
    let bias = match dims.bias_bytes {
        Some(b) => align_up(n * b, C0_BYTES)?,
        None => 0,
    };
    let scale = align_up(n * dims.channel_wise_coeff * SCALE_PARAM_BYTES, C0_BYTES)?;
    Some((bias, scale))
}

/// The footprint of the smallest per-core tile any blocking could assign under `layout`.
///
/// Splitting an axis across more cores never grows the per-core minimal tile, so this
/// bounds the footprint of every candidate blocking.
pub fn min_footprint(dims: &ConvDims, layout: SplitLayout) -> Option<MemoryFootprint> {
    let cube = dims.cube;
    let l1 = match layout {
        SplitLayout::MergedSpatial => {
            let ho = (cube.m0 / dims.wo + 2).min(dims.ho);
            let hi = dims.infer_hi(ho);
            let fmap = align_up(hi * dims.wi * cube.k0 * dims.fmap_bytes, C0_BYTES)?;
            let k_bl1 = dims.kh * dims.kw * cube.k0;
            let weight = align_up(k_bl1 * cube.n0 * dims.weight_bytes, C0_BYTES)?;
            let (bias, scale) = channel_params_bytes(dims, cube.n0)?;
            fmap + weight + bias + scale
        }
        SplitLayout::HeightWidth => height_width_min_l1(dims, dims.wo)?,
    };

    let mut footprint = MemoryFootprint::zero();
    footprint[MemoryLevel::L1] = l1;
    footprint[MemoryLevel::L0A] = cube.m0 * cube.k0 * dims.fmap_bytes;
    footprint[MemoryLevel::L0B] = cube.k0 * cube.n0 * dims.weight_bytes;
    footprint[MemoryLevel::L0C] = cube.m0 * cube.n0 * MAD_BYTES;
    Some(footprint)
}

/// L1 bytes of the smallest [SplitLayout::HeightWidth] tile of a block `wo` output
/// columns wide: one fractal of output positions against one block of input channels
/// and one fractal of output channels.
///
/// Only single-row problems split the width across cores, and for those a narrower block
/// never needs more, so the whole-problem value bounds every core.
pub(crate) fn height_width_min_l1(dims: &ConvDims, wo: u64) -> Option<u64> {
    let cube = dims.cube;
    let (ho_tile, wo_tile) = if wo < cube.m0 {
        (ceil_div(cube.m0, wo)?, wo)
    } else {
        (1, cube.m0)
    };
    let hi = dims.infer_hi(ho_tile);
    let (fmap, k_bl1) = if dims.c04 {
        // Small-channel rows are loaded whole once there is more than one of them.
        let wi = if dims.hi > 1 {
            dims.wi
        } else {
            dims.infer_wi(wo_tile)
        };
        (
            align_up(hi * wi * C04_CIN * dims.fmap_bytes, C0_BYTES)?,
            align_up(C04_CIN * dims.kh * dims.kw, cube.k0)?,
        )
    } else {
        let wi = dims.infer_wi(wo_tile);
        (
            align_up(hi * wi * cube.k0 * dims.fmap_bytes, C0_BYTES)?,
            dims.kh * dims.kw * cube.k0,
        )
    };
    let weight = align_up(k_bl1 * cube.n0 * dims.weight_bytes, C0_BYTES)?;
    let (bias, scale) = channel_params_bytes(dims, cube.n0)?;
    Some(fmap + weight + bias + scale)
}

fn instruction_limits(
    dims: &ConvDims,
    layout: SplitLayout,
    budget: &HardwareBudget,
) -> Result<(), Rejection> {
    match layout {
        SplitLayout::MergedSpatial => {
            if dims.wi > budget.limits.max_load_width {
                return Err(Rejection::InstructionLimit {
                    what: "input width",
                    value: dims.wi,
                    limit: budget.limits.max_load_width,
                });
            }
            if dims.fmap_format == FmapFormat::Ndhwc {
                let stride = dims
                    .ci
                    .saturating_mul(dims.hi)
                    .saturating_mul(dims.wi)
                    .saturating_mul(dims.dilation_d);
                if stride > MAX_40_BIT {
                    return Err(Rejection::InstructionLimit {
                        what: "fmap plane stride",
                        value: stride,
                        limit: MAX_40_BIT,
                    });
                }
            }
        }
        SplitLayout::HeightWidth => {
            if dims.fmap_format == FmapFormat::Ndhwc {
                let stride = dims.wo.saturating_mul(dims.co);
                if stride > MAX_32_BIT {
                    return Err(Rejection::InstructionLimit {
                        what: "output row stride",
                        value: stride,
                        limit: MAX_32_BIT,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Decide whether `layout` can serve `dims` at all on `budget`.
pub fn check_layout(
    dims: &ConvDims,
    layout: SplitLayout,
    budget: &HardwareBudget,
) -> Result<MemoryFootprint, Rejection> {
    let footprint = min_footprint(dims, layout).ok_or(Rejection::NotComputable)?;
    fits(&footprint, budget).inspect_err(|rejection| {
        debug!("{layout} layout rejected: {rejection}");
    })?;
    instruction_limits(dims, layout, budget).inspect_err(|rejection| {
        debug!("{layout} layout rejected: {rejection}");
    })?;
    Ok(footprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::problem::tests::arb_conv2d;
    use crate::problem::{ProblemShape, WeightFormat};
    use crate::target::TargetId;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    fn resnet_stem() -> ConvDims {
        ProblemShape::conv2d(
            nz!(1u32),
            nz!(3u32),
            nz!(64u32),
            [nz!(224u32), nz!(224u32)],
            [nz!(7u32), nz!(7u32)],
        )
        .with_stride([nz!(1u32), nz!(2u32), nz!(2u32)])
        .dims()
        .unwrap()
    }

    #[test]
    fn test_merged_min_footprint_matches_hand_computation() {
        let dims = resnet_stem();
        // wo = 109, so one fractal row plus two of halo: ho = 2, hi = 9.
        let fp = min_footprint(&dims, SplitLayout::MergedSpatial).unwrap();
        let fmap = 9 * 224 * 16 * 2;
        let weight = 7 * 7 * 16 * 16 * 2;
        assert_eq!(fp[MemoryLevel::L1], fmap + weight);
        assert_eq!(fp[MemoryLevel::L0A], 16 * 16 * 2);
        assert_eq!(fp[MemoryLevel::L0C], 16 * 16 * 4);
    }

    #[test]
    fn test_bias_and_scale_are_aligned() {
        let dims = ProblemShape::matmul(nz!(64u32), nz!(64u32), nz!(64u32))
            .with_bias(Dtype::Float16)
            .with_channel_wise_coeff(1)
            .dims()
            .unwrap();
        assert_eq!(channel_params_bytes(&dims, 16), Some((32, 32)));
        assert_eq!(channel_params_bytes(&dims, 1), Some((32, 32)));
    }

    #[test]
    fn test_int8_ncdhw_skips_channel_params() {
        let dims = ProblemShape::conv3d(
            nz!(1u32),
            nz!(16u32),
            nz!(16u32),
            [nz!(4u32), nz!(8u32), nz!(8u32)],
            [nz!(1u32), nz!(1u32), nz!(1u32)],
        )
        .with_dtypes(Dtype::Int8, Dtype::Int8, Dtype::Int32)
        .with_bias(Dtype::Int32)
        .dims()
        .unwrap();
        assert_eq!(channel_params_bytes(&dims, 16), Some((0, 0)));
    }

    #[test]
    fn test_small_channel_variant_uses_four_channel_blocks() {
        let p = ProblemShape::conv2d(
            nz!(1u32),
            nz!(3u32),
            nz!(64u32),
            [nz!(224u32), nz!(224u32)],
            [nz!(7u32), nz!(7u32)],
        )
        .with_format(FmapFormat::Nhwc, WeightFormat::Nd);
        let dims = p.dims().unwrap();
        let c04 = min_footprint(&dims, SplitLayout::HeightWidth).unwrap();
        let plain = min_footprint(
            &ConvDims {
                c04: false,
                ..dims
            },
            SplitLayout::HeightWidth,
        )
        .unwrap();
        assert!(c04[MemoryLevel::L1] < plain[MemoryLevel::L1]);
    }

    #[test]
    fn test_wide_input_rejects_merged_layout() {
        let dims = ProblemShape::conv2d(
            nz!(1u32),
            nz!(16u32),
            nz!(16u32),
            [nz!(2u32), nz!(40000u32)],
            [nz!(1u32), nz!(1u32)],
        )
        .dims()
        .unwrap();
        let budget = HardwareBudget::for_target(TargetId::Datacenter).with_capacity(MemoryLevel::L1, 1 << 30);
        assert!(matches!(
            check_layout(&dims, SplitLayout::MergedSpatial, &budget),
            Err(Rejection::InstructionLimit {
                what: "input width",
                ..
            })
        ));
        assert!(check_layout(&dims, SplitLayout::HeightWidth, &budget).is_ok());
    }

    #[test]
    fn test_tiny_l1_rejects_with_required_bytes() {
        let dims = resnet_stem();
        let budget = HardwareBudget::default().with_capacity(MemoryLevel::L1, 1024);
        let required = min_footprint(&dims, SplitLayout::MergedSpatial).unwrap()[MemoryLevel::L1];
        assert_eq!(
            check_layout(&dims, SplitLayout::MergedSpatial, &budget),
            Err(Rejection::Capacity {
                level: MemoryLevel::L1,
                required,
                capacity: 1024
            })
        );
    }

    proptest! {
        #[test]
        fn test_fits_is_monotone_in_capacity(
            p in arb_conv2d(),
            layout in any::<SplitLayout>(),
            level in any::<MemoryLevel>(),
            extra in 0u64..1 << 20,
        ) {
            let dims = p.dims().unwrap();
            let budget = HardwareBudget::default();
            let fp = min_footprint(&dims, layout).unwrap();
            if fits(&fp, &budget).is_ok() {
                let larger = budget.with_capacity(level, budget.capacity(level) + extra);
                prop_assert!(fits(&fp, &larger).is_ok());
            }
        }
    }
}
