use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use strum::IntoEnumIterator;

use crate::blocking::{Axis, Blocking, AXIS_COUNT};
use crate::cost::Cost;
use crate::layout::SplitLayout;
use crate::memorylimits::{check_layout, Rejection};
use crate::problem::{ConvDims, OpKind};
use crate::target::HardwareBudget;
use crate::utils::{factors, merge_axis_candidates};

/// The block-dimension decision for one problem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct BlockDimResult {
    pub layout: SplitLayout,
    pub blocking: Blocking,
    pub cost: Cost,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutRejection {
    pub layout: SplitLayout,
    pub reason: Rejection,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("no split layout is feasible: {}", .rejections.iter().join("; "))]
    Infeasible { rejections: Vec<LayoutRejection> },
}

impl Display for LayoutRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.layout, self.reason)
    }
}

/// Candidate block counts for every [Axis] under one layout.
///
/// Each range is ascending, free of duplicates, and bounded by the core count.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AxisRanges {
    ranges: [Vec<u32>; AXIS_COUNT],
    /// Height splits set aside because they would leave output rows shorter than one
    /// efficient burst. Only consulted when rebalancing a blocking that leaves cores idle.
    spare_ho: Vec<u32>,
}

impl AxisRanges {
    pub fn build(dims: &ConvDims, budget: &HardwareBudget, layout: SplitLayout) -> Self {
        let core_factors = factors(budget.cores, budget.cores);
        let cap = u64::from(budget.cores);
        let candidates = |extent: u64, merge: bool| -> Vec<u32> {
            let base = factors(extent, cap)
                .into_iter()
                .filter_map(|f| u32::try_from(f).ok())
                .collect::<Vec<_>>();
            if merge {
                merge_axis_candidates(extent, &base, &core_factors)
            } else {
                base
            }
        };

        let mut ranges: [Vec<u32>; AXIS_COUNT] = Default::default();
        for axis in Axis::iter() {
            ranges[axis as usize] = vec![1];
        }
        let mut spare_ho = vec![];

        ranges[Axis::Batch as usize] = if dims.batch >= 2 * cap {
            core_factors.clone()
        } else {
            candidates(dims.batch, true)
        };
        // Small-channel fractals are already padded along N; extra N splits only add waste.
        let co1 = dims.cur_co().div_ceil(dims.cube.n0);
        ranges[Axis::N as usize] = candidates(co1, !dims.c04);
        if dims.is_3d() {
            ranges[Axis::Dout as usize] = candidates(dims.dout, true);
        }
        ranges[Axis::Group as usize] = candidates(dims.cur_groups(), true);

        match layout {
            SplitLayout::MergedSpatial => {
                let m1 = (dims.ho * dims.wo).div_ceil(dims.cube.m0);
                ranges[Axis::M as usize] = candidates(m1, true);
            }
            SplitLayout::HeightWidth => {
                let ho_range = candidates(dims.ho, true);
                if dims.kind == OpKind::Conv1d {
                    ranges[Axis::Ho as usize] = ho_range;
                    ranges[Axis::Wo as usize] = candidates(dims.wo, true);
                } else {
                    let (safe, spare) = separate_ho(dims, budget, ho_range);
                    ranges[Axis::Ho as usize] = safe;
                    spare_ho = spare;
                }
            }
        }
        AxisRanges { ranges, spare_ho }
    }

    pub fn range(&self, axis: Axis) -> &[u32] {
        &self.ranges[axis as usize]
    }

    pub fn spare_ho(&self) -> &[u32] {
        &self.spare_ho
    }

    /// The first axis with no candidates, if any.
    fn first_empty(&self) -> Option<Axis> {
        Axis::iter().find(|&axis| self.range(axis).is_empty())
    }
}

/// Split `ho_range` into the height splits that keep at least one burst of output
/// per core, and those that do not.
fn separate_ho(
    dims: &ConvDims,
    budget: &HardwareBudget,
    ho_range: Vec<u32>,
) -> (Vec<u32>, Vec<u32>) {
    let min_burst = budget.min_burst(dims.fmap_bytes);
    if dims.wo >= min_burst {
        return (ho_range, vec![]);
    }
    let min_rows = min_burst / dims.wo;
    let first_valid = ho_range
        .iter()
        .position(|&h| dims.ho.div_ceil(u64::from(h)) >= min_rows)
        .unwrap_or(ho_range.len());
    let mut safe = ho_range;
    let spare = safe.drain(..first_valid).collect::<Vec<_>>();
    if safe.is_empty() {
        safe.push(1);
    }
    (safe, spare)
}

/// Whether `candidate` should replace `incumbent` when both have the same cost.
///
/// Higher core utilization wins. At equal utilization, larger (batch, depth) splits win
/// because they leave a core's spatial and channel extents whole.
fn wins_tie(candidate: &Blocking, incumbent: &Blocking, cores: u64) -> bool {
    let cand_util = candidate.product() / cores;
    let inc_util = incumbent.product() / cores;
    if cand_util != inc_util {
        return cand_util > inc_util;
    }
    let key = |b: &Blocking| (b[Axis::Batch], b[Axis::Dout]);
    key(candidate) > key(incumbent)
}

/// Widen the height split of a HeightWidth blocking that leaves cores idle, using
/// height splits that were set aside as too fine.
fn rebalance_tail(blocking: &mut Blocking, spare_ho: &[u32], cores: u64) {
    if blocking.product() == cores {
        return;
    }
    let others = blocking.with(Axis::Ho, 1).product();
    for &h in spare_ho {
        if others * u64::from(h) <= cores {
            blocking[Axis::Ho] = blocking[Axis::Ho].max(h);
        }
    }
}

/// Find the cheapest blocking of `dims` under a single `layout`.
pub fn search_layout(
    dims: &ConvDims,
    budget: &HardwareBudget,
    layout: SplitLayout,
) -> Result<BlockDimResult, Rejection> {
    check_layout(dims, layout, budget)?;
    let ranges = AxisRanges::build(dims, budget, layout);
    if let Some(axis) = ranges.first_empty() {
        debug!("{layout} has no candidate {axis:?} split");
        return Err(Rejection::EmptyRange { axis });
    }
    debug!("{layout} ranges: {ranges:?}");

    let cores = u64::from(budget.cores);
    let mut best: Option<(Blocking, Cost)> = Cost::compute(dims, budget, &Blocking::ones(), layout)
        .map(|cost| (Blocking::ones(), cost));

    for counts in Axis::iter()
        .map(|axis| ranges.range(axis).iter().copied())
        .multi_cartesian_product()
    {
        let mut array = [1u32; AXIS_COUNT];
        array.copy_from_slice(&counts);
        let blocking = Blocking::from_counts(array);
        if blocking.product() > cores {
            continue;
        }
        let Some(cost) = Cost::compute(dims, budget, &blocking, layout) else {
            continue;
        };
        let replace = match &best {
            None => true,
            Some((inc_blocking, inc_cost)) => {
                cost.main < inc_cost.main
                    || (cost.main == inc_cost.main && wins_tie(&blocking, inc_blocking, cores))
            }
        };
        if replace {
            best = Some((blocking, cost));
        }
    }

    let Some((mut blocking, mut cost)) = best else {
        return Err(Rejection::NotComputable);
    };
    if layout == SplitLayout::HeightWidth {
        let before = blocking;
        rebalance_tail(&mut blocking, ranges.spare_ho(), cores);
        if blocking != before {
            match Cost::compute(dims, budget, &blocking, layout) {
                Some(widened) => {
                    debug!("rebalanced {before} to {blocking}");
                    cost = widened;
                }
                None => blocking = before,
            }
        }
    }
    Ok(BlockDimResult {
        layout,
        blocking,
        cost,
    })
}

/// Choose a split layout and a blocking for `dims`.
///
/// Every layout that passes the capacity and instruction-limit checks is searched. The
/// cheapest wins, with ties going to the earlier [SplitLayout].
pub fn block_dim_search(
    dims: &ConvDims,
    budget: &HardwareBudget,
) -> Result<BlockDimResult, SearchError> {
    let mut best: Option<BlockDimResult> = None;
    let mut rejections = vec![];
    for layout in SplitLayout::iter() {
        match search_layout(dims, budget, layout) {
            Ok(result) => {
                debug!(
                    "{layout} best: {} at cost {}",
                    result.blocking, result.cost.main
                );
                if best.map_or(true, |b| result.cost.main < b.cost.main) {
                    best = Some(result);
                }
            }
            Err(reason) => rejections.push(LayoutRejection { layout, reason }),
        }
    }
    match best {
        Some(result) => Ok(result),
        None => {
            let err = SearchError::Infeasible { rejections };
            warn!("{err}");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memorylimits::min_footprint;
    use crate::problem::tests::arb_conv2d;
    use crate::problem::{FmapFormat, ProblemShape, WeightFormat};
    use crate::target::tests::arb_budget;
    use crate::target::{MemoryLevel, TargetId};
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    /// A problem whose every axis range is `{1}`.
    fn unsplittable() -> ConvDims {
        ProblemShape::conv2d(
            nz!(1u32),
            nz!(16u32),
            nz!(16u32),
            [nz!(3u32), nz!(3u32)],
            [nz!(3u32), nz!(3u32)],
        )
        .dims()
        .unwrap()
    }

    #[test]
    fn test_minimal_budget_keeps_unsplit_blocking() {
        let dims = unsplittable();
        let fp = min_footprint(&dims, SplitLayout::MergedSpatial).unwrap();
        let budget = HardwareBudget::default().with_capacity(MemoryLevel::L1, fp[MemoryLevel::L1]);
        let result = search_layout(&dims, &budget, SplitLayout::MergedSpatial).unwrap();
        assert_eq!(result.blocking, Blocking::ones());
        assert_eq!(result.blocking.product(), 1);
    }

    #[test]
    fn test_budget_below_minimal_tile_is_rejected() {
        let dims = unsplittable();
        let budget = HardwareBudget::default().with_capacity(MemoryLevel::L1, 64);
        let err = block_dim_search(&dims, &budget).unwrap_err();
        let SearchError::Infeasible { rejections } = err;
        assert_eq!(rejections.len(), 2);
        assert!(rejections
            .iter()
            .all(|r| matches!(r.reason, Rejection::Capacity { level: MemoryLevel::L1, .. })));
    }

    #[test]
    fn test_zero_cores_has_empty_ranges() {
        let dims = unsplittable();
        let budget = HardwareBudget::default().with_cores(0);
        let err = search_layout(&dims, &budget, SplitLayout::MergedSpatial).unwrap_err();
        assert_eq!(err, Rejection::EmptyRange { axis: Axis::Batch });
    }

    #[test]
    fn test_large_batch_considers_every_core_factor() {
        let dims = ProblemShape::conv2d(
            nz!(1024u32),
            nz!(16u32),
            nz!(16u32),
            [nz!(4u32), nz!(4u32)],
            [nz!(1u32), nz!(1u32)],
        )
        .dims()
        .unwrap();
        let budget = HardwareBudget::for_target(TargetId::Datacenter);
        let ranges = AxisRanges::build(&dims, &budget, SplitLayout::MergedSpatial);
        assert_eq!(ranges.range(Axis::Batch), &[1, 2, 4, 8, 16, 32]);
        let result = block_dim_search(&dims, &budget).unwrap();
        assert!(result.blocking.product() <= 32);
        assert_eq!(result.blocking[Axis::Batch], 32);
    }

    #[test]
    fn test_non_3d_problem_never_splits_depth() {
        let dims = unsplittable();
        let budget = HardwareBudget::default();
        for layout in SplitLayout::iter() {
            assert_eq!(AxisRanges::build(&dims, &budget, layout).range(Axis::Dout), &[1]);
        }
    }

    #[test]
    fn test_conv1d_splits_width() {
        let dims = ProblemShape::conv1d(nz!(1u32), nz!(16u32), nz!(16u32), nz!(4096u32), nz!(3u32))
            .dims()
            .unwrap();
        let budget = HardwareBudget::default();
        let ranges = AxisRanges::build(&dims, &budget, SplitLayout::HeightWidth);
        assert_eq!(ranges.range(Axis::Ho), &[1]);
        assert!(ranges.range(Axis::Wo).contains(&32));
        assert!(ranges.spare_ho().is_empty());
    }

    #[test]
    fn test_short_rows_move_height_splits_to_spare() {
        // wo = 8 is under a 64-element burst, and ho = 4 can never reach 8 rows per core.
        let dims = ProblemShape::conv2d(
            nz!(1u32),
            nz!(16u32),
            nz!(16u32),
            [nz!(4u32), nz!(8u32)],
            [nz!(1u32), nz!(1u32)],
        )
        .with_format(FmapFormat::Nhwc, WeightFormat::Fractal)
        .dims()
        .unwrap();
        let budget = HardwareBudget::default();
        let ranges = AxisRanges::build(&dims, &budget, SplitLayout::HeightWidth);
        assert_eq!(ranges.range(Axis::Ho), &[1]);
        assert_eq!(ranges.spare_ho(), &[1, 2, 4]);

        let result = search_layout(&dims, &budget, SplitLayout::HeightWidth).unwrap();
        assert_eq!(result.blocking[Axis::Ho], 4);
        assert!(result.blocking.product() <= 32);
    }

    #[test]
    fn test_rebalance_respects_core_count() {
        let mut blocking = Blocking::ones().with(Axis::Batch, 4).with(Axis::N, 2);
        rebalance_tail(&mut blocking, &[1, 2, 4, 8], 32);
        assert_eq!(blocking[Axis::Ho], 4);
        assert_eq!(blocking.product(), 32);

        let mut full = Blocking::ones().with(Axis::Batch, 32);
        rebalance_tail(&mut full, &[1, 2, 4], 32);
        assert_eq!(full[Axis::Ho], 1);
    }

    #[test]
    fn test_tie_prefers_utilization_then_batch() {
        let a = Blocking::ones().with(Axis::Batch, 2);
        let b = Blocking::ones().with(Axis::N, 2);
        assert!(wins_tie(&a, &b, 2));
        assert!(!wins_tie(&b, &a, 2));
        let full = Blocking::ones().with(Axis::N, 4);
        assert!(wins_tie(&full, &a, 4));
        assert!(!wins_tie(&a, &full, 4));
    }

    proptest! {
        #[test]
        fn test_blocking_never_exceeds_cores(p in arb_conv2d(), cores in 1u32..=48) {
            let dims = p.dims().unwrap();
            let budget = HardwareBudget::default().with_cores(cores);
            if let Ok(result) = block_dim_search(&dims, &budget) {
                prop_assert!(result.blocking.product() <= u64::from(cores));
                prop_assert!(result.blocking.counts().iter().all(|&c| c >= 1));
            }
        }

        #[test]
        fn test_search_is_deterministic(p in arb_conv2d()) {
            let dims = p.dims().unwrap();
            let budget = HardwareBudget::for_target(TargetId::Standard);
            prop_assert_eq!(block_dim_search(&dims, &budget), block_dim_search(&dims, &budget));
        }

        #[test]
        fn test_more_capacity_never_costs_more(
            p in arb_conv2d(),
            small in arb_budget(),
            level in any::<MemoryLevel>(),
            extra in 0u64..(1 << 18),
        ) {
            let dims = p.dims().unwrap();
            let large = small.with_capacity(level, small.capacity(level) + extra);
            if let Ok(a) = block_dim_search(&dims, &small) {
                let b = block_dim_search(&dims, &large);
                prop_assert!(b.is_ok());
                prop_assert!(b.unwrap().cost.main <= a.cost.main);
            }
        }

        #[test]
        fn test_split_counts_are_within_extents(p in arb_conv2d()) {
            let dims = p.dims().unwrap();
            let budget = HardwareBudget::default();
            let result = block_dim_search(&dims, &budget).unwrap();
            prop_assert!(u64::from(result.blocking[Axis::Ho]) <= dims.ho);
            prop_assert!(u64::from(result.blocking[Axis::Group]) <= dims.cur_groups());
        }
    }
}
