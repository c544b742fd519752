//! Tile derivation for [SplitLayout::HeightWidth] blocks, where fmap tiles are rectangles
//! of output rows and fractal-aligned output columns.
//!
//! [SplitLayout::HeightWidth]: crate::layout::SplitLayout::HeightWidth

use log::debug;

use super::{
    bytes, pad_compensation, single_buffer_small_l0, DoubleBuffer, IterateOrder, L0Tile, L1Mode,
    L1Tile, SingleCoreShape, SpatialTiles, TileError, TilingResult,
};
use crate::common::{C04_CIN, C0_BYTES, MAD_BYTES};
use crate::memorylimits::{channel_params_bytes, height_width_min_l1};
use crate::problem::ConvDims;
use crate::search::BlockDimResult;
use crate::target::HardwareBudget;
use crate::utils::{align_up, factors, factors_with_pow2, pair_factors};

/// One candidate L1 tile.
///
/// `k_al1` counts input channels and excludes the kernel window. Small-channel fmaps hold
/// a single four-channel block, counted as 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct HwL1 {
    k_al1: u64,
    k_bl1: u64,
    ho: u64,
    wo: u64,
    n: u64,
}

/// L1 bytes of the whole and of the smallest operand tiles.
#[derive(Clone, Copy, Debug, Default)]
struct Extremes {
    k_al1_max: u64,
    k_bl1_max: u64,
    fmap_max: u64,
    fmap_min: u64,
    weight_max: u64,
    weight_min: u64,
    params_max: u64,
    params_min: u64,
}

#[derive(Clone, Debug, Default)]
struct HwRanges {
    k_al1: Vec<u64>,
    k_bl1: Vec<u64>,
    ho: Vec<u64>,
    wo: Vec<u64>,
    n: Vec<u64>,
}

struct HwDeriver<'a> {
    dims: &'a ConvDims,
    budget: &'a HardwareBudget,
    single: SingleCoreShape,
    c04: bool,
    /// Small-channel fmaps with more than one input row load whole rows.
    wo_full_c04: bool,
    pb: DoubleBuffer,
    ho_l0: u64,
    wo_l0: u64,
    k_l0: u64,
    n_l0: u64,
    /// Candidate L0 tiles, kept for the growth pass after the K decision.
    l0_ranges: HwRanges,
    ext: Extremes,
    ranges: HwRanges,
    init: HwL1,
    mode: L1Mode,
}

/// Rounds up, saturating when the aligned value is not representable.
fn align_sat(value: u64, to: u64) -> u64 {
    align_up(value, to).unwrap_or(u64::MAX)
}

fn scaled(counts: Vec<u64>, unit: u64) -> Vec<u64> {
    counts.into_iter().map(|c| c * unit).collect()
}

/// Drop values below `init`, keeping `init` itself as the first candidate.
fn restrict(range: &mut Vec<u64>, init: u64) {
    range.retain(|&v| v >= init);
    if range.first() != Some(&init) {
        range.insert(0, init);
    }
}

/// The last value of `range` accepted by `fits` before the first rejected one. The flag
/// is set when every value fits. `None` when even the first value is rejected.
fn grow_along(range: &[u64], fits: impl Fn(u64) -> bool) -> Option<(u64, bool)> {
    let mut best = None;
    for &v in range {
        if !fits(v) {
            return best.map(|b| (b, false));
        }
        best = Some(v);
    }
    best.map(|b| (b, true))
}

impl<'a> HwDeriver<'a> {
    fn new(dims: &'a ConvDims, budget: &'a HardwareBudget, single: SingleCoreShape) -> Self {
        let cube = dims.cube;
        HwDeriver {
            dims,
            budget,
            single,
            c04: dims.c04,
            wo_full_c04: dims.c04 && dims.hi > 1,
            pb: DoubleBuffer {
                al1: 2,
                bl1: 2,
                al0: 2,
                bl0: 2,
                cl0: 1,
            },
            ho_l0: 1,
            wo_l0: cube.m0,
            k_l0: cube.k0,
            n_l0: cube.n0,
            l0_ranges: HwRanges::default(),
            ext: Extremes::default(),
            ranges: HwRanges::default(),
            init: HwL1 {
                k_al1: cube.k0,
                k_bl1: cube.k0,
                ho: 1,
                wo: cube.m0,
                n: cube.n0,
            },
            mode: L1Mode::NoneFullLoad,
        }
    }

    fn ci0_hk_wk(&self) -> u64 {
        self.dims.kh * self.dims.kw * self.dims.cube.k0
    }

    /// Reduction extent of the small-channel weight: four channels per kernel tap.
    fn c04_k(&self) -> u64 {
        align_sat(C04_CIN * self.dims.kh * self.dims.kw, self.dims.cube.k0)
    }

    fn wo_aligned(&self) -> u64 {
        align_sat(self.single.wo, self.dims.cube.m0)
    }

    fn n_full(&self) -> u64 {
        self.single.co1 * self.dims.cube.n0
    }

    fn infer_wi_l1(&self, wo: u64) -> u64 {
        if self.c04 && wo == self.single.wo {
            self.dims.wi
        } else {
            self.dims.infer_wi(wo)
        }
    }

    /// Bias plus scale bytes for `n` output channels.
    fn params(&self, n: u64) -> u64 {
        channel_params_bytes(self.dims, n).map_or(u64::MAX, |(bias, scale)| {
            bias.saturating_add(scale)
        })
    }

    fn fmap_bytes(&self, hi: u64, wi: u64, k_al1: u64, pb: u64) -> u64 {
        let fb = self.dims.fmap_bytes;
        if self.c04 {
            let quantum = (C0_BYTES / (fb * C04_CIN)).max(1);
            bytes(&[align_sat(bytes(&[hi, wi]), quantum), pb, C04_CIN, fb])
        } else {
            align_sat(bytes(&[hi, wi, k_al1, fb, pb]), C0_BYTES)
        }
    }

    /// L1 bytes of the tile `t`, with bias and scale staged for `params_n` channels.
    fn l1_size(&self, t: &HwL1, params_n: u64) -> u64 {
        let d = self.dims;
        let fmap = self.fmap_bytes(
            d.infer_hi(t.ho),
            self.infer_wi_l1(t.wo),
            t.k_al1,
            self.pb.al1,
        );
        let weight = if self.c04 {
            bytes(&[t.k_bl1, t.n, self.pb.bl1, d.weight_bytes])
        } else {
            align_sat(bytes(&[t.n, t.k_bl1, d.weight_bytes, self.pb.bl1]), C0_BYTES)
        };
        fmap.saturating_add(weight)
            .saturating_add(self.params(params_n))
    }

    /// L1 bytes needed to feed one L0 tile, without buffering.
    fn l1_for_l0(&self, ho: u64, wo: u64, n: u64) -> u64 {
        let d = self.dims;
        let hi = d.infer_hi(ho);
        let (fmap, weight) = if self.c04 {
            let wi = if self.wo_full_c04 {
                d.wi
            } else {
                self.infer_wi_l1(wo)
            };
            (
                self.fmap_bytes(hi, wi, 1, 1),
                bytes(&[self.c04_k(), n, d.weight_bytes]),
            )
        } else {
            (
                bytes(&[d.cube.k0, self.infer_wi_l1(wo), hi, d.fmap_bytes]),
                bytes(&[self.ci0_hk_wk(), n, d.weight_bytes]),
            )
        };
        fmap.saturating_add(weight).saturating_add(self.params(n))
    }

    fn l0a(&self, m: u64, k: u64) -> u64 {
        bytes(&[m, k, self.pb.al0, self.dims.fmap_bytes])
    }

    fn l0b(&self, k: u64, n: u64) -> u64 {
        bytes(&[k, n, self.pb.bl0, self.dims.weight_bytes])
    }

    fn l0_fits(&self, m: u64, k: u64, n: u64) -> bool {
        self.l0a(m, k) <= self.budget.l0a_bytes
            && self.l0b(k, n) <= self.budget.l0b_bytes
            && bytes(&[m, n, self.pb.cl0, MAD_BYTES]) <= self.budget.l0c_bytes
    }

    fn check_min_l1(&self) -> Result<(), TileError> {
        let required = height_width_min_l1(self.dims, self.single.wo).ok_or(
            TileError::NotComputable {
                what: "minimal L1 tile",
            },
        )?;
        if required > self.budget.l1_bytes {
            return Err(TileError::MinimalTileOverflow {
                required,
                capacity: self.budget.l1_bytes,
            });
        }
        Ok(())
    }

    fn init_ping_pong(&mut self) {
        let cube = self.dims.cube;
        let smallest = HwL1 {
            k_al1: if self.c04 { 1 } else { cube.k0 },
            k_bl1: if self.c04 { self.c04_k() } else { self.ci0_hk_wk() },
            ho: 1,
            wo: cube.m0,
            n: cube.n0,
        };
        if self.l1_size(&smallest, cube.n0) > self.budget.l1_bytes {
            self.pb.al1 = 1;
            self.pb.bl1 = 1;
        }
        self.pb = single_buffer_small_l0(self.dims, self.budget, self.pb);
    }

    fn init_l0_ranges(&mut self) -> Result<(), TileError> {
        let d = self.dims;
        let b = self.budget;
        let cube = d.cube;
        let single = self.single;
        let m_max = (b.l0a_bytes / (cube.k0 * self.pb.al0 * d.fmap_bytes))
            .min(b.l0c_bytes / (cube.n0 * self.pb.cl0 * MAD_BYTES));
        let ho_max = (m_max / single.wo).min(single.ho).max(1);
        let wo_max = m_max.min(single.wo);
        let n_max = (b.l0b_bytes / (cube.k0 * self.pb.bl0 * d.weight_bytes))
            .min(b.l0c_bytes / (cube.m0 * self.pb.cl0 * MAD_BYTES));
        let ranges = HwRanges {
            ho: factors_with_pow2(single.ho, ho_max),
            wo: scaled(
                factors_with_pow2(single.wo.div_ceil(cube.m0), wo_max.div_ceil(cube.m0)),
                cube.m0,
            ),
            n: scaled(factors_with_pow2(single.co1, n_max / cube.n0), cube.n0),
            ..HwRanges::default()
        };
        for (what, range) in [("hoL0", &ranges.ho), ("woL0", &ranges.wo), ("nL0", &ranges.n)] {
            if range.is_empty() {
                return Err(TileError::EmptyRange { what });
            }
        }
        self.l0_ranges = ranges;
        Ok(())
    }

    /// Grow the L0 tile from the smallest candidates. N advances first while it is shorter
    /// than the spatial side; otherwise width advances before height.
    fn decide_l0(&mut self) {
        let r = &self.l0_ranges;
        let lens = [r.ho.len(), r.wo.len(), r.n.len()];
        let k0 = self.dims.cube.k0;
        let l1 = self.budget.l1_bytes;
        let tile = |idx: [usize; 3]| (r.ho[idx[0]], r.wo[idx[1]], r.n[idx[2]]);
        let fits = |idx: [usize; 3]| {
            let (ho, wo, n) = tile(idx);
            self.l0_fits(ho * wo, k0, n) && self.l1_for_l0(ho, wo, n) <= l1
        };
        let advance = |idx: [usize; 3]| -> Option<[usize; 3]> {
            let (ho, wo, n) = tile(idx);
            let order = if n < ho * wo { [2, 1, 0] } else { [1, 0, 2] };
            let axis = order.into_iter().find(|&axis| idx[axis] + 1 < lens[axis])?;
            let mut next = idx;
            next[axis] += 1;
            Some(next)
        };

        let mut idx = [0; 3];
        if fits(idx) {
            while let Some(next) = advance(idx) {
                if !fits(next) {
                    break;
                }
                idx = next;
            }
        } else {
            debug!("smallest L0 tile overflows L1 while double-buffered");
        }
        let (mut ho, wo, n) = tile(idx);
        // A partial row of whole-row small-channel loads cannot span rows.
        if self.wo_full_c04 && self.dims.wo % wo != 0 {
            ho = 1;
        }
        (self.ho_l0, self.wo_l0, self.n_l0) = (ho, wo, n);
        if bytes(&[ho * wo, n, 2, MAD_BYTES]) <= self.budget.l0c_bytes {
            self.pb.cl0 = 2;
        }
    }

    fn init_extremes(&mut self) {
        let d = self.dims;
        let cube = d.cube;
        let single = self.single;
        let (fb, wb) = (d.fmap_bytes, d.weight_bytes);
        let n_full = self.n_full();
        let ho_min = single.ho.min(self.ho_l0);
        let wo_min = if self.wo_full_c04 {
            self.wo_aligned()
        } else {
            align_sat(single.wo.min(self.wo_l0), cube.m0)
        };
        let hi_max = d.infer_hi(single.ho);
        let hi_min = d.infer_hi(ho_min);

        self.ext = if self.c04 {
            let c04_k = self.c04_k();
            let (wi_max, wi_min) = if self.wo_full_c04 {
                (d.wi, d.wi)
            } else {
                (self.infer_wi_l1(self.wo_aligned()), self.infer_wi_l1(wo_min))
            };
            Extremes {
                k_al1_max: 1,
                k_bl1_max: c04_k,
                fmap_max: self.fmap_bytes(hi_max, wi_max, 1, 1),
                fmap_min: self.fmap_bytes(hi_min, wi_min, 1, self.pb.al1),
                weight_max: bytes(&[c04_k, n_full, wb]),
                weight_min: bytes(&[c04_k, self.n_l0, wb, self.pb.bl1]),
                ..Extremes::default()
            }
        } else {
            let ci1 = d.ci1();
            let k_al1_max = ci1 * cube.k0;
            let k_bl1_max = ci1 * self.ci0_hk_wk() * d.kd;
            Extremes {
                k_al1_max,
                k_bl1_max,
                fmap_max: bytes(&[
                    d.kd,
                    hi_max,
                    self.infer_wi_l1(self.wo_aligned()),
                    k_al1_max,
                    fb,
                ]),
                fmap_min: bytes(&[self.infer_wi_l1(wo_min), hi_min, cube.k0, fb, self.pb.al1]),
                weight_max: bytes(&[k_bl1_max, n_full, wb]),
                weight_min: bytes(&[self.ci0_hk_wk(), self.n_l0, wb, self.pb.bl1]),
                ..Extremes::default()
            }
        };
        self.ext.params_max = self.params(n_full);
        self.ext.params_min = self.params(self.n_l0);
    }

    fn init_l1_ranges(&mut self) {
        let d = self.dims;
        let limits = &self.budget.limits;
        let ci1 = d.ci1();
        let (k_al1, k_bl1) = if self.c04 {
            (vec![self.ext.k_al1_max], vec![self.ext.k_bl1_max])
        } else {
            let k_al1 = scaled(factors(ci1, ci1), d.cube.k0)
                .into_iter()
                .filter(|&k| k * d.kh * d.kw <= limits.post_k_limit)
                .collect();
            (k_al1, scaled(factors(ci1, ci1), self.ci0_hk_wk()))
        };
        let wo = if self.wo_full_c04 {
            vec![self.wo_aligned()]
        } else {
            scaled(
                factors(self.wo_aligned().div_ceil(self.wo_l0), u64::MAX),
                self.wo_l0,
            )
        };
        let ho = scaled(factors(self.single.ho / self.ho_l0, u64::MAX), self.ho_l0);
        let mut ranges = HwRanges {
            k_al1,
            k_bl1,
            ho,
            wo,
            n: scaled(
                factors(self.n_full().div_ceil(self.n_l0), u64::MAX),
                self.n_l0,
            ),
        };
        ranges.ho.retain(|&h| d.infer_hi(h) <= limits.max_load_width);
        ranges.wo.retain(|&w| d.infer_wi(w) <= limits.max_load_width);
        self.ranges = ranges;
    }

    fn decide_l1_mode(&mut self) {
        let e = self.ext;
        let d = self.dims;
        let l1 = self.budget.l1_bytes;
        let limits = &self.budget.limits;
        let m_exceeds = self.single.ho * self.wo_aligned() > limits.m_start_limit;
        let k_exceeds = !self.c04 && d.ci1() * self.ci0_hk_wk() > limits.post_k_limit;

        let total = |terms: [u64; 3]| terms.into_iter().fold(0u64, u64::saturating_add);
        let all_full = !m_exceeds && total([e.fmap_max, e.weight_max, e.params_max]) <= l1;
        let weight_full = total([e.fmap_min, e.weight_max, e.params_max]) <= l1;
        let fmap_full =
            !m_exceeds && !k_exceeds && total([e.fmap_max, e.weight_min, e.params_min]) <= l1;
        let weight_first = e
            .weight_max
            .saturating_mul(self.budget.weight_l1_bandwidth_ratio)
            .saturating_add(e.params_max)
            >= e.fmap_max;

        self.mode = match (all_full, weight_first) {
            (true, _) => L1Mode::AllFullLoad,
            (false, true) if weight_full => L1Mode::FullLoadBl1,
            (false, true) if fmap_full => L1Mode::FullLoadAl1,
            (false, false) if fmap_full => L1Mode::FullLoadAl1,
            (false, false) if weight_full => L1Mode::FullLoadBl1,
            _ => L1Mode::NoneFullLoad,
        };
    }

    /// Pick the starting L1 tile for the chosen mode and drop smaller candidates.
    fn init_l1_tile(&mut self) {
        let d = self.dims;
        let e = self.ext;
        let split = HwL1 {
            k_al1: if self.c04 { e.k_al1_max } else { d.cube.k0 },
            k_bl1: if self.c04 { e.k_bl1_max } else { self.ci0_hk_wk() },
            ho: self.ho_l0,
            wo: if self.wo_full_c04 {
                self.wo_aligned()
            } else {
                self.wo_l0
            },
            n: self.n_l0,
        };
        let full = HwL1 {
            k_al1: e.k_al1_max * d.kd,
            k_bl1: e.k_bl1_max,
            ho: self.single.ho,
            wo: self.wo_aligned(),
            n: self.n_full(),
        };
        self.init = match self.mode {
            L1Mode::AllFullLoad => full,
            L1Mode::FullLoadAl1 => HwL1 {
                k_bl1: split.k_bl1,
                n: split.n,
                ..full
            },
            L1Mode::FullLoadBl1 => HwL1 {
                k_bl1: full.k_bl1,
                n: full.n,
                ..split
            },
            L1Mode::NoneFullLoad => split,
        };
        let init = self.init;
        restrict(&mut self.ranges.k_al1, init.k_al1);
        restrict(&mut self.ranges.k_bl1, init.k_bl1);
        restrict(&mut self.ranges.ho, init.ho);
        restrict(&mut self.ranges.wo, init.wo);
        restrict(&mut self.ranges.n, init.n);

        match self.mode {
            L1Mode::AllFullLoad => {
                self.pb.al1 = 1;
                self.pb.bl1 = 1;
            }
            L1Mode::FullLoadAl1 => self.pb.al1 = 1,
            L1Mode::FullLoadBl1 => self.pb.bl1 = 1,
            L1Mode::NoneFullLoad => {}
        }
    }

    fn fits_l1(&self, t: &HwL1) -> bool {
        self.l1_size(t, t.n) <= self.budget.l1_bytes
    }

    /// Grow the fmap channel depth, then stack kernel-depth planes once every channel fits.
    fn iter_k_al1(&self, t: HwL1) -> Option<u64> {
        if self.c04 {
            return Some(self.init.k_al1);
        }
        let fits = |k| self.fits_l1(&HwL1 { k_al1: k, ..t });
        let (k, whole) = grow_along(&self.ranges.k_al1, fits)?;
        if !whole {
            return Some(k);
        }
        Some(
            (2..=self.dims.kd)
                .map(|depth| depth * k)
                .take_while(|&stacked| fits(stacked))
                .last()
                .unwrap_or(k),
        )
    }

    fn iter_k_bl1(&self, t: HwL1) -> Option<u64> {
        if self.c04 {
            return Some(self.init.k_bl1);
        }
        let fits = |k| self.fits_l1(&HwL1 { k_bl1: k, ..t });
        let (k, whole) = grow_along(&self.ranges.k_bl1, fits)?;
        if !whole {
            return Some(k);
        }
        Some(
            (2..=self.dims.kd)
                .map(|depth| depth * k)
                .take_while(|&stacked| fits(stacked))
                .last()
                .unwrap_or(k),
        )
    }

    fn iter_n(&self, t: HwL1) -> Option<u64> {
        grow_along(&self.ranges.n, |n| self.fits_l1(&HwL1 { n, ..t })).map(|(n, _)| n)
    }

    fn spatial_fits(&self, t: &HwL1) -> bool {
        t.ho * t.wo <= self.budget.limits.m_start_limit && self.fits_l1(t)
    }

    /// Grow the fmap tile's width with a single row of `ranges.ho`, then its height.
    fn iter_ho_wo(&self, t: HwL1) -> Option<(u64, u64)> {
        let row = HwL1 {
            ho: self.ranges.ho[0],
            ..t
        };
        let (wo, _) = grow_along(&self.ranges.wo, |wo| {
            self.spatial_fits(&HwL1 { wo, ..row })
        })?;
        let (ho, _) = grow_along(&self.ranges.ho, |ho| {
            self.spatial_fits(&HwL1 { ho, wo, ..t })
        })?;
        Some((ho, wo))
    }

    /// Grow both reduction tiles, alternating between them, starting with the weight.
    fn iter_k_both(&self, t: HwL1) -> HwL1 {
        let r = &self.ranges;
        let (mut ia, mut ib) = (0, 0);
        let mut best = HwL1 {
            k_al1: r.k_al1[0],
            k_bl1: r.k_bl1[0],
            ..t
        };
        if self.c04 {
            return best;
        }
        let mut grow_weight = true;
        loop {
            let candidate = HwL1 {
                k_al1: r.k_al1[ia],
                k_bl1: r.k_bl1[ib],
                ..t
            };
            if !self.fits_l1(&candidate) {
                break;
            }
            best = candidate;
            let a_open = ia + 1 < r.k_al1.len();
            let b_open = ib + 1 < r.k_bl1.len();
            match (grow_weight, a_open, b_open) {
                (_, false, false) => break,
                (true, _, true) | (false, false, true) => ib += 1,
                _ => ia += 1,
            }
            grow_weight = !grow_weight;
        }
        best
    }

    fn k_full_fits(&self, k_al1: u64, k_bl1: u64) -> bool {
        let d = self.dims;
        (self.c04 || k_al1 * d.kh * d.kw <= self.budget.limits.post_k_limit)
            && self.fits_l1(&HwL1 {
                k_al1,
                k_bl1,
                ..self.init
            })
    }

    fn fmap_k_full(&self) -> Option<(HwL1, IterateOrder)> {
        let t = HwL1 {
            k_al1: self.ext.k_al1_max,
            ..self.init
        };
        let k_bl1 = self.iter_k_bl1(t)?;
        let (ho, wo) = self.iter_ho_wo(HwL1 { k_bl1, ..t })?;
        Some((HwL1 { k_bl1, ho, wo, ..t }, IterateOrder::NFirst))
    }

    fn weight_k_full(&self) -> Option<(HwL1, IterateOrder)> {
        let t = HwL1 {
            k_bl1: self.ext.k_bl1_max,
            ..self.init
        };
        let k_al1 = self.iter_k_al1(t)?;
        let n = self.iter_n(HwL1 { k_al1, ..t })?;
        Some((HwL1 { k_al1, n, ..t }, IterateOrder::MFirst))
    }

    /// Neither operand is fully resident. Prefer keeping one operand's whole reduction
    /// depth, then grow the remaining tiles; fall back to single-buffered K growth.
    fn decide_streamed(&mut self) -> (HwL1, IterateOrder) {
        let e = self.ext;
        let first = self.init;
        let candidate = if self.k_full_fits(e.k_al1_max, e.k_bl1_max) {
            let t = HwL1 {
                k_al1: e.k_al1_max,
                k_bl1: e.k_bl1_max,
                ..first
            };
            self.iter_n(t).and_then(|n| {
                let (ho, wo) = self.iter_ho_wo(HwL1 { n, ..t })?;
                Some((HwL1 { n, ho, wo, ..t }, IterateOrder::MFirst))
            })
        } else {
            let weight_first =
                e.weight_max.saturating_mul(self.budget.weight_l1_bandwidth_ratio) >= e.fmap_max;
            let weight_k = self.k_full_fits(first.k_al1, e.k_bl1_max);
            let fmap_k = self.k_full_fits(e.k_al1_max, first.k_bl1);
            match (weight_first, weight_k, fmap_k) {
                (true, true, _) | (false, true, false) => self.weight_k_full(),
                (true, false, true) | (false, _, true) => self.fmap_k_full(),
                (true, false, false) => Some((self.iter_k_both(first), IterateOrder::NFirst)),
                (false, false, false) => Some((self.iter_k_both(first), IterateOrder::MFirst)),
            }
        };

        let (t, mut order) = match candidate.filter(|(t, _)| self.fits_l1(t)) {
            Some(found) => found,
            None => {
                debug!("no double-buffered L1 tile fits; single-buffering L1");
                self.pb.al1 = 1;
                self.pb.bl1 = 1;
                (self.iter_k_both(first), IterateOrder::MFirst)
            }
        };
        let fmap_full = t.ho >= self.single.ho && t.wo >= self.single.wo && t.k_al1 >= e.k_al1_max;
        let weight_full = t.n >= self.n_full() && t.k_bl1 >= e.k_bl1_max;
        if fmap_full && !weight_full {
            order = IterateOrder::NFirst;
        } else if !fmap_full && weight_full {
            order = IterateOrder::MFirst;
        }
        (t, order)
    }

    /// Returns the L1 tile, the iteration order, and whether bias and scale for the whole
    /// block are staged up front.
    fn decide_l1(&mut self) -> (HwL1, IterateOrder, bool) {
        let init = self.init;
        let r = &self.ranges;
        match self.mode {
            L1Mode::AllFullLoad => (init, IterateOrder::MFirst, true),
            L1Mode::FullLoadBl1 => {
                let row = HwL1 {
                    ho: r.ho[0],
                    wo: r.wo[0],
                    ..init
                };
                let k_al1 = self.iter_k_al1(row).unwrap_or(init.k_al1);
                let t = HwL1 { k_al1, ..init };
                let (ho, wo) = self.iter_ho_wo(t).unwrap_or((r.ho[0], r.wo[0]));
                (HwL1 { ho, wo, ..t }, IterateOrder::MFirst, true)
            }
            L1Mode::FullLoadAl1 => {
                let k_bl1 = self.iter_k_bl1(HwL1 { n: r.n[0], ..init }).unwrap_or(init.k_bl1);
                let t = HwL1 { k_bl1, ..init };
                let n = self.iter_n(t).unwrap_or(init.n);
                (HwL1 { n, ..t }, IterateOrder::NFirst, false)
            }
            L1Mode::NoneFullLoad => {
                let (t, order) = self.decide_streamed();
                (t, order, false)
            }
        }
    }

    /// Single-buffer the fmap when one tile already covers the whole block.
    fn update_l1_double_buffer(&mut self, t: &HwL1) {
        let k_full = self.c04 || t.k_al1 >= self.ext.k_al1_max;
        if self.single.ho <= t.ho && self.single.wo <= t.wo && k_full {
            self.pb.al1 = 1;
        }
    }

    /// Whether bias and scale for every output channel of the block stay in L1.
    fn decide_channel_params(&self, t: &HwL1, staged: bool) -> bool {
        let n_full = self.n_full();
        let l1 = self.budget.l1_bytes;
        let mut full = staged;
        if !full && self.l1_size(t, t.n) < l1 && self.l1_size(t, n_full) <= l1 {
            full = true;
        }
        let bias = n_full * self.dims.bias_bytes.unwrap_or(0);
        full && bias <= self.budget.limits.max_burst_bytes
    }

    fn decide_k_l0(&mut self, t: &HwL1) {
        let d = self.dims;
        let b = self.budget;
        let k0 = d.cube.k0;
        let m = self.ho_l0 * self.wo_l0;
        let n = self.n_l0;
        self.k_l0 = pair_factors(bytes(&[t.k_al1, d.kh, d.kw]), t.k_bl1, u64::MAX)
            .into_iter()
            .filter(|k| k % k0 == 0)
            .take_while(|&k| self.l0a(m, k) <= b.l0a_bytes && self.l0b(k, n) <= b.l0b_bytes)
            .last()
            .unwrap_or(k0);

        // The whole reduction fits in one single-buffered L0 pass.
        let k_max = self.ext.k_bl1_max;
        let whole_block = self.single.ho <= self.ho_l0
            && self.single.wo <= self.wo_l0
            && self.n_full() <= n
            && t.k_bl1 == k_max
            && t.k_al1 == self.ext.k_al1_max;
        if whole_block
            && bytes(&[m, k_max, d.fmap_bytes]) <= b.l0a_bytes
            && bytes(&[k_max, n, d.weight_bytes]) <= b.l0b_bytes
        {
            self.k_l0 = k_max;
        }
    }

    /// Largest candidate above `current` that divides `l1_extent` and passes `fits`.
    fn grow_l0(range: &[u64], current: u64, l1_extent: u64, fits: impl Fn(u64) -> bool) -> u64 {
        range
            .iter()
            .copied()
            .filter(|&v| v > current && v <= l1_extent && l1_extent % v == 0)
            .take_while(|&v| fits(v))
            .last()
            .unwrap_or(current)
    }

    fn update_l0_double_buffer(&mut self, t: &HwL1, order: IterateOrder) -> IterateOrder {
        let k_full = self.k_l0 == self.ext.k_bl1_max;
        if self.single.ho <= self.ho_l0 && self.single.wo <= self.wo_l0 && k_full {
            self.pb.al0 = 1;
        }
        if k_full && self.n_full() == self.n_l0 {
            self.pb.bl0 = 1;
        }
        if k_full && self.pb.al0 == 2 && self.pb.bl0 == 2 {
            let k = self.k_l0;
            let r = &self.l0_ranges;
            match order {
                IterateOrder::MFirst => {
                    let m = self.ho_l0 * self.wo_l0;
                    let n = Self::grow_l0(&r.n, self.n_l0, t.n, |n| self.l0_fits(m, k, n));
                    if n != self.n_l0 {
                        self.n_l0 = n;
                        self.pb.bl0 = 1;
                    }
                }
                IterateOrder::NFirst => {
                    let (ho, n) = (self.ho_l0, self.n_l0);
                    let wo = Self::grow_l0(&r.wo, self.wo_l0, t.wo, |wo| {
                        self.l0_fits(ho * wo, k, n)
                    });
                    let ho = Self::grow_l0(&r.ho, ho, t.ho, |ho| self.l0_fits(ho * wo, k, n));
                    if (ho, wo) != (self.ho_l0, self.wo_l0) {
                        (self.ho_l0, self.wo_l0) = (ho, wo);
                        self.pb.al0 = 1;
                    }
                }
            }
        }
        if bytes(&[self.ho_l0 * self.wo_l0, self.n_l0, MAD_BYTES]) <= self.budget.l0c_bytes / 2 {
            self.pb.cl0 = 2;
        }
        match (self.pb.al0, self.pb.bl0) {
            (2, 1) => IterateOrder::MFirst,
            (1, 2) => IterateOrder::NFirst,
            _ => order,
        }
    }
}

pub(super) fn derive(
    dims: &ConvDims,
    budget: &HardwareBudget,
    block: &BlockDimResult,
    single: SingleCoreShape,
) -> Result<TilingResult, TileError> {
    let mut deriver = HwDeriver::new(dims, budget, single);
    deriver.check_min_l1()?;
    deriver.init_ping_pong();
    deriver.init_l0_ranges()?;
    deriver.decide_l0();
    deriver.init_extremes();
    deriver.init_l1_ranges();
    deriver.decide_l1_mode();
    deriver.init_l1_tile();
    let (t, order, staged) = deriver.decide_l1();
    deriver.update_l1_double_buffer(&t);
    let params_full = deriver.decide_channel_params(&t, staged);
    deriver.decide_k_l0(&t);
    let order = deriver.update_l0_double_buffer(&t, order);

    let spatial = SpatialTiles {
        ho_al1: t.ho,
        wo_al1: t.wo,
        ho_l0: deriver.ho_l0,
        wo_l0: deriver.wo_l0,
    };
    let l1 = L1Tile {
        k_al1: if deriver.c04 {
            deriver.c04_k()
        } else {
            bytes(&[t.k_al1, dims.kh, dims.kw])
        },
        k_bl1: t.k_bl1,
        m_al1: t.ho * t.wo,
        n_bl1: t.n,
    };
    let l0 = L0Tile {
        m: spatial.ho_l0 * spatial.wo_l0,
        k: deriver.k_l0,
        n: deriver.n_l0,
    };
    let mode = deriver.mode;
    debug!(
        "{mode} height-width tiling: {spatial:?}, L1 {l1:?}, L0 {l0:?}, buffers {:?}, {order:?}",
        deriver.pb
    );

    Ok(TilingResult {
        block: *block,
        single,
        l1,
        l0,
        spatial: Some(spatial),
        double_buffer: deriver.pb,
        l1_mode: mode,
        order,
        bias_full_load: params_full && dims.bias_bytes.is_some(),
        scale_full_load: params_full && dims.channel_wise_coeff > 0,
        inner_batch: 1,
        pad_compensation: pad_compensation(dims, block),
        c04: deriver.c04,
        group_mode: dims.group_mode,
    })
}
