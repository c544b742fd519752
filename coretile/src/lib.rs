pub mod blocking;
pub mod cache;
pub mod common;
pub mod cost;
pub mod dispatch;
pub mod layout;
pub mod memorylimits;
pub mod pprint;
pub mod problem;
pub mod search;
pub mod target;
pub mod tiling;
pub mod utils;

use log::info;
use rayon::prelude::*;
use std::sync::Arc;

use crate::cache::TilingCache;
use crate::problem::{ProblemShape, ShapeError};
use crate::search::{block_dim_search, SearchError};
use crate::target::HardwareBudget;
use crate::tiling::{derive_tiling, TileError, TilingResult};

#[derive(thiserror::Error, Debug)]
pub enum PlanError {
    #[error("invalid problem shape: {0}")]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error("tile derivation failed: {0}")]
    Tile(#[from] TileError),
}

/// Choose a core blocking and per-tier tiles for `problem` on `budget`.
pub fn plan(problem: &ProblemShape, budget: &HardwareBudget) -> Result<TilingResult, PlanError> {
    let dims = problem.dims()?;
    let block = block_dim_search(&dims, budget)?;
    let tiling = derive_tiling(&dims, budget, &block)?;
    info!(
        "planned {problem}: {} layout, {} at cost {}, {} L1",
        block.layout, block.blocking, block.cost.main, tiling.l1_mode
    );
    Ok(tiling)
}

/// Plan independent problems in parallel, sharing `cache` between them.
///
/// Results are in the order of `problems`.
pub fn plan_many(
    problems: &[ProblemShape],
    budget: &HardwareBudget,
    cache: &TilingCache,
) -> Vec<Result<Arc<TilingResult>, PlanError>> {
    problems
        .par_iter()
        .map(|problem| cache.get_or_plan(problem, budget))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking::{Axis, Blocking};
    use crate::common::{DimSize, Dtype};
    use crate::layout::SplitLayout;
    use crate::memorylimits::min_footprint;
    use crate::problem::tests::arb_conv2d;
    use crate::problem::{FmapFormat, Padding, WeightFormat};
    use crate::target::tests::arb_budget;
    use crate::target::{MemoryLevel, TargetId};
    use nonzero::nonzero as nz;
    use proptest::prelude::*;
    use strum::IntoEnumIterator;

    /// The smallest L1 any layout of `problem` can run in.
    fn minimal_l1(problem: &ProblemShape) -> u64 {
        let dims = problem.dims().unwrap();
        SplitLayout::iter()
            .filter_map(|layout| min_footprint(&dims, layout))
            .map(|fp| fp[MemoryLevel::L1])
            .min()
            .unwrap()
    }

    fn with_l1(l1: u64) -> HardwareBudget {
        HardwareBudget::default().with_capacity(MemoryLevel::L1, l1)
    }

    #[test]
    fn test_plan_resnet_layers() {
        let budget = HardwareBudget::for_target(TargetId::Standard);
        let stem = ProblemShape::conv2d(
            nz!(8u32),
            nz!(3u32),
            nz!(64u32),
            [nz!(224u32), nz!(224u32)],
            [nz!(7u32), nz!(7u32)],
        )
        .with_stride([nz!(1u32), nz!(2u32), nz!(2u32)])
        .with_pad(Padding {
            top: 3,
            bottom: 3,
            left: 3,
            right: 3,
            ..Default::default()
        })
        .with_format(FmapFormat::Nhwc, WeightFormat::Nd)
        .with_bias(Dtype::Float32);
        let tiling = plan(&stem, &budget).unwrap();
        assert!(tiling.blocking().product() <= 24);
        assert!(tiling.blocking()[Axis::Batch] >= 1);
    }

    #[test]
    fn test_plan_conv3d() {
        let problem = ProblemShape::conv3d(
            nz!(2u32),
            nz!(32u32),
            nz!(64u32),
            [nz!(16u32), nz!(28u32), nz!(28u32)],
            [nz!(3u32), nz!(3u32), nz!(3u32)],
        );
        let tiling = plan(&problem, &HardwareBudget::default()).unwrap();
        assert!(tiling.blocking().product() <= 32);
        assert!(tiling.single.dout >= 1);
        assert_eq!(tiling.inner_batch, 1);
    }

    #[test]
    fn test_invalid_shape_is_reported() {
        let problem = ProblemShape::conv2d(
            nz!(1u32),
            nz!(6u32),
            nz!(8u32),
            [nz!(8u32), nz!(8u32)],
            [nz!(1u32), nz!(1u32)],
        )
        .with_groups(nz!(4u32));
        assert!(matches!(
            plan(&problem, &HardwareBudget::default()),
            Err(PlanError::Shape(_))
        ));
    }

    #[test]
    fn test_infeasible_budget_is_reported() {
        let problem = ProblemShape::matmul(nz!(64u32), nz!(64u32), nz!(64u32));
        let budget = HardwareBudget::default().with_capacity(MemoryLevel::L0C, 16);
        let err = plan(&problem, &budget).unwrap_err();
        assert!(matches!(err, PlanError::Search(SearchError::Infeasible { .. })));
        assert!(err.to_string().contains("L0C"));
    }

    #[test]
    fn test_plan_many_preserves_order() {
        let cache = TilingCache::new(16);
        let budget = HardwareBudget::default();
        let problems = [64u32, 128, 256, 64]
            .into_iter()
            .map(|m| ProblemShape::matmul(DimSize::new(m).unwrap(), nz!(64u32), nz!(64u32)))
            .collect::<Vec<_>>();
        let results = plan_many(&problems, &budget, &cache);
        assert_eq!(results.len(), 4);
        for (problem, result) in problems.iter().zip(&results) {
            let expected = plan(problem, &budget).unwrap();
            assert_eq!(**result.as_ref().unwrap(), expected);
        }
        assert!(cache.len() <= 3);
    }

    #[test]
    fn test_dilated_strided_conv_plans_at_every_feasible_l1() {
        let problem = ProblemShape::conv2d(
            nz!(11u32),
            nz!(17u32),
            nz!(97u32),
            [nz!(95u32), nz!(143u32)],
            [nz!(2u32), nz!(2u32)],
        )
        .with_stride([nz!(1u32), nz!(2u32), nz!(2u32)])
        .with_dilation([nz!(1u32), nz!(2u32), nz!(2u32)]);
        let min = minimal_l1(&problem);
        let mut capacities = vec![min, min + 1, 2 * min, 166_208, 184_256, 524_288];
        capacities.retain(|&l1| l1 >= min);
        capacities.sort_unstable();
        let mut last_cost = u64::MAX;
        for l1 in capacities {
            let tiling = plan(&problem, &with_l1(l1)).unwrap();
            assert!(tiling.block.cost.main <= last_cost, "cost rose at L1 = {l1}");
            last_cost = tiling.block.cost.main;
        }
    }

    #[test]
    fn test_minimal_l1_plans_unsplit_block() {
        let problem = ProblemShape::conv2d(
            nz!(1u32),
            nz!(16u32),
            nz!(16u32),
            [nz!(3u32), nz!(3u32)],
            [nz!(3u32), nz!(3u32)],
        );
        let min = minimal_l1(&problem);
        let tiling = plan(&problem, &with_l1(min)).unwrap();
        assert_eq!(*tiling.blocking(), Blocking::ones());
        assert!(matches!(
            plan(&problem, &with_l1(min - 1)),
            Err(PlanError::Search(SearchError::Infeasible { .. }))
        ));
    }

    proptest! {
        #[test]
        fn test_plan_at_minimal_l1_succeeds(p in arb_conv2d()) {
            let min = minimal_l1(&p);
            prop_assert!(plan(&p, &with_l1(min)).is_ok());
        }

        #[test]
        fn test_plan_survives_more_capacity(
            p in arb_conv2d(),
            small in arb_budget(),
            level in any::<MemoryLevel>(),
            extra in 0u64..1 << 18,
        ) {
            let large = small.with_capacity(level, small.capacity(level) + extra);
            if let Ok(tight) = plan(&p, &small) {
                let roomy = plan(&p, &large);
                prop_assert!(roomy.is_ok(), "{:?} after growing {} by {}", roomy, level, extra);
                prop_assert!(roomy.unwrap().block.cost.main <= tight.block.cost.main);
            }
        }
    }
}
