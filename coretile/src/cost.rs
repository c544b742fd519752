use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::blocking::{Axis, Blocking};
use crate::common::C04_CIN;
use crate::layout::SplitLayout;
use crate::problem::{ConvDims, FmapFormat, WeightFormat};
use crate::target::HardwareBudget;
use crate::utils::{align_up, ceil_div};

pub type MainCost = u64;

/// Modeled latency of one candidate blocking, with the terms it was computed from.
///
/// Traffic terms are in elements moved per core. Costs order by `main` only.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub struct Cost {
    pub main: MainCost,
    pub fmap: u64,
    pub weight: u64,
    pub output: u64,
    pub compute: u64,
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.main.cmp(&other.main)
    }
}

fn product(terms: &[u64]) -> Option<u64> {
    terms.iter().try_fold(1u64, |acc, &t| acc.checked_mul(t))
}

/// The multiplier on weight traffic for the way `dims` stores its weight.
pub fn weight_bandwidth_coeff(dims: &ConvDims, budget: &HardwareBudget) -> u64 {
    let coeffs = &budget.bandwidth_coeffs;
    if matches!(dims.fmap_format, FmapFormat::Nchw | FmapFormat::Ncdhw) {
        if dims.weight_format == WeightFormat::Fractal {
            return coeffs.unit;
        }
        if !dims.is_optimized_group() {
            return coeffs.strided;
        }
    }
    if dims.c04 && dims.fmap_format == FmapFormat::Nhwc {
        return coeffs.small_channel;
    }
    coeffs.unit
}

impl Cost {
    /// Model the per-core latency of `blocking` under `layout`.
    ///
    /// Returns `None` if any term is not computable (a zero divisor or an overflow); the
    /// caller should treat the candidate as infeasible.
    pub fn compute(
        dims: &ConvDims,
        budget: &HardwareBudget,
        blocking: &Blocking,
        layout: SplitLayout,
    ) -> Option<Cost> {
        match layout {
            SplitLayout::MergedSpatial => merged_spatial(dims, budget, blocking),
            SplitLayout::HeightWidth => height_width(dims, budget, blocking),
        }
    }
}

fn merged_spatial(dims: &ConvDims, budget: &HardwareBudget, blocking: &Blocking) -> Option<Cost> {
    let m0 = dims.cube.m0;
    let k0 = dims.cube.k0;
    let n0 = dims.cube.n0;
    let ci1 = ceil_div(dims.cur_ci(), k0)?;
    let co1 = ceil_div(dims.cur_co(), n0)?;

    let b = ceil_div(dims.batch, u64::from(blocking[Axis::Batch]))?;
    let g = ceil_div(dims.cur_groups(), u64::from(blocking[Axis::Group]))?;
    let d = ceil_div(dims.dout, u64::from(blocking[Axis::Dout]))?;
    let m_dim = u64::from(blocking[Axis::M]);
    let n_dim = u64::from(blocking[Axis::N]);
    let n_elems = ceil_div(co1 * n0, n_dim)?;

    let fmap = product(&[
        b,
        g,
        d,
        ceil_div(align_up(dims.hi * dims.wi, m0)?, m_dim)?,
        dims.kd,
        ci1,
        k0,
    ])?;
    let mut weight = product(&[g, dims.kd, ci1, dims.kh, dims.kw, k0, b])?;
    if !dims.is_optimized_group() {
        weight = weight.checked_mul(n_elems)?;
    }
    let output = product(&[
        b,
        g,
        n_elems,
        d,
        ceil_div(align_up(dims.ho * dims.wo, m0)?, m_dim)?,
    ])?;
    let compute = product(&[
        b,
        g,
        ceil_div(co1, n_dim)?,
        d,
        dims.kd,
        ci1,
        dims.kh,
        dims.kw,
        ceil_div(ceil_div(dims.ho * dims.wo, m0)?, m_dim)?,
    ])?;
    finish(dims, budget, fmap, weight, output, compute)
}

fn height_width(dims: &ConvDims, budget: &HardwareBudget, blocking: &Blocking) -> Option<Cost> {
    let m0 = dims.cube.m0;
    let k0 = dims.cube.k0;
    let n0 = dims.cube.n0;
    let (ci1, ci0) = if dims.c04 {
        (1, C04_CIN)
    } else {
        (ceil_div(dims.cur_ci(), k0)?, k0)
    };
    let co1 = ceil_div(dims.cur_co(), n0)?;

    let b = ceil_div(dims.batch, u64::from(blocking[Axis::Batch]))?;
    let g = ceil_div(dims.cur_groups(), u64::from(blocking[Axis::Group]))?;
    let d = ceil_div(dims.dout, u64::from(blocking[Axis::Dout]))?;
    let ho_dim = u64::from(blocking[Axis::Ho]);
    let wo_dim = u64::from(blocking[Axis::Wo]);
    let n_dim = u64::from(blocking[Axis::N]);
    let n_elems = ceil_div(co1 * n0, n_dim)?;
    let ho = ceil_div(dims.ho, ho_dim)?;
    let wo = ceil_div(dims.wo, wo_dim)?;

    let fmap = product(&[
        b,
        g,
        d,
        dims.kd,
        ci1,
        ceil_div(dims.hi, ho_dim)?,
        ceil_div(dims.wi, wo_dim)?,
        ci0,
    ])?;
    let weight_k = if dims.c04 {
        align_up(ci1 * dims.kh * dims.kw, k0)?
    } else {
        product(&[ci1, dims.kh, dims.kw, k0])?
    };
    let mut weight = product(&[b, g, dims.kd, weight_k])?;
    if !dims.is_optimized_group() {
        weight = weight.checked_mul(n_elems)?;
    }
    let output = product(&[b, g, d, n_elems, ho, wo])?;
    let compute = product(&[
        b,
        g,
        ceil_div(co1, n_dim)?,
        d,
        dims.kd,
        ci1,
        dims.kh,
        dims.kw,
        ceil_div(ho * wo, m0)?,
    ])?;
    finish(dims, budget, fmap, weight, output, compute)
}

fn finish(
    dims: &ConvDims,
    budget: &HardwareBudget,
    fmap: u64,
    weight: u64,
    output: u64,
    compute: u64,
) -> Option<Cost> {
    let traffic = weight
        .checked_mul(weight_bandwidth_coeff(dims, budget))?
        .checked_add(fmap)?
        .checked_add(output)?;
    // Integer division: fractional cycles of traffic are deliberately dropped.
    let main = (traffic.checked_div(budget.bandwidth)?).checked_add(compute)?;
    Some(Cost {
        main,
        fmap,
        weight,
        output,
        compute,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Dtype;
    use crate::problem::tests::arb_conv2d;
    use crate::problem::ProblemShape;
    use crate::target::TargetId;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    fn pointwise() -> ConvDims {
        ProblemShape::conv2d(
            nz!(2u32),
            nz!(32u32),
            nz!(64u32),
            [nz!(16u32), nz!(16u32)],
            [nz!(1u32), nz!(1u32)],
        )
        .dims()
        .unwrap()
    }

    #[test]
    fn test_merged_spatial_unsplit_cost() {
        let dims = pointwise();
        let budget = HardwareBudget::for_target(TargetId::Datacenter);
        let cost = Cost::compute(&dims, &budget, &Blocking::ones(), SplitLayout::MergedSpatial)
            .unwrap();
        // ci1 = 2, co1 = 4, hw = 256.
        assert_eq!(cost.fmap, 2 * 256 * 2 * 16);
        assert_eq!(cost.weight, 2 * 16 * 2 * 64);
        assert_eq!(cost.output, 2 * 64 * 256);
        assert_eq!(cost.compute, 2 * 4 * 2 * 16);
        // NCHW with an ND weight is fetched with the strided coefficient.
        let traffic = cost.fmap + 4 * cost.weight + cost.output;
        assert_eq!(cost.main, traffic / 128 + cost.compute);
    }

    #[test]
    fn test_splitting_batch_halves_every_term() {
        let dims = pointwise();
        let budget = HardwareBudget::default();
        let layout = SplitLayout::MergedSpatial;
        let whole = Cost::compute(&dims, &budget, &Blocking::ones(), layout).unwrap();
        let halved =
            Cost::compute(&dims, &budget, &Blocking::ones().with(Axis::Batch, 2), layout)
                .unwrap();
        assert_eq!(halved.fmap * 2, whole.fmap);
        assert_eq!(halved.weight * 2, whole.weight);
        assert_eq!(halved.output * 2, whole.output);
        assert_eq!(halved.compute * 2, whole.compute);
    }

    #[test]
    fn test_zero_bandwidth_is_not_computable() {
        let dims = pointwise();
        let budget = HardwareBudget {
            bandwidth: 0,
            ..HardwareBudget::default()
        };
        assert_eq!(
            Cost::compute(&dims, &budget, &Blocking::ones(), SplitLayout::HeightWidth),
            None
        );
    }

    #[test]
    fn test_weight_coefficient_by_format() {
        let budget = HardwareBudget::default();
        let p = ProblemShape::conv2d(
            nz!(1u32),
            nz!(3u32),
            nz!(64u32),
            [nz!(32u32), nz!(32u32)],
            [nz!(3u32), nz!(3u32)],
        );
        let coeff = |p: ProblemShape| weight_bandwidth_coeff(&p.dims().unwrap(), &budget);
        assert_eq!(coeff(p.clone()), budget.bandwidth_coeffs.strided);
        assert_eq!(
            coeff(p.clone().with_format(FmapFormat::Nchw, WeightFormat::Fractal)),
            budget.bandwidth_coeffs.unit
        );
        assert_eq!(
            coeff(p.clone().with_format(FmapFormat::Nhwc, WeightFormat::Nd)),
            budget.bandwidth_coeffs.small_channel
        );
        assert_eq!(
            coeff(
                p.with_format(FmapFormat::Nhwc, WeightFormat::Nd)
                    .with_dtypes(Dtype::Float32, Dtype::Float32, Dtype::Float32)
            ),
            budget.bandwidth_coeffs.unit
        );
    }

    proptest! {
        #[test]
        fn test_cost_is_deterministic(
            p in arb_conv2d(),
            layout in any::<SplitLayout>(),
            batch in 1u32..4,
            n in 1u32..4,
        ) {
            let dims = p.dims().unwrap();
            let budget = HardwareBudget::default();
            let blocking = Blocking::ones().with(Axis::Batch, batch).with(Axis::N, n);
            let a = Cost::compute(&dims, &budget, &blocking, layout);
            let b = Cost::compute(&dims, &budget, &blocking, layout);
            prop_assert_eq!(a, b);
        }
    }
}
