use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::blocking::{Axis, Blocking};
use crate::common::{C0_BYTES, MAD_BYTES};
use crate::dispatch::DispatchKey;
use crate::layout::SplitLayout;
use crate::memorylimits::channel_params_bytes;
use crate::problem::{ConvDims, GroupMode};
use crate::search::BlockDimResult;
use crate::target::HardwareBudget;
use crate::utils::{align_up, factors, factors_with_pow2, gcd};

mod hw;

/// How much of each operand stays resident in L1 for the whole per-core block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum L1Mode {
    AllFullLoad,
    /// The fmap (operand A) is fully resident; weight tiles stream.
    FullLoadAl1,
    /// The weight (operand B) is fully resident; fmap tiles stream.
    FullLoadBl1,
    NoneFullLoad,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum IterateOrder {
    /// M is the outer loop.
    MFirst,
    /// N is the outer loop.
    NFirst,
}

/// Buffer counts per tier: 2 means ping-pong, 1 means single-buffered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct DoubleBuffer {
    pub al1: u64,
    pub bl1: u64,
    pub al0: u64,
    pub bl0: u64,
    pub cl0: u64,
}

/// Extents of the block one core computes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SingleCoreShape {
    pub batch: u64,
    pub groups: u64,
    pub dout: u64,
    pub ho: u64,
    pub wo: u64,
    /// Output positions, i.e. the M extent of the per-core matmul.
    pub m: u64,
    pub co1: u64,
}

/// L1 tiles, in elements. `k_al1` and `k_bl1` include the kernel window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct L1Tile {
    pub k_al1: u64,
    pub k_bl1: u64,
    pub m_al1: u64,
    pub n_bl1: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct L0Tile {
    pub m: u64,
    pub k: u64,
    pub n: u64,
}

/// Output rows and columns covered by the fmap tiles of a [SplitLayout::HeightWidth]
/// block. Widths are padded to whole fractals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct SpatialTiles {
    pub ho_al1: u64,
    pub wo_al1: u64,
    pub ho_l0: u64,
    pub wo_l0: u64,
}

/// The complete tiling decision for one problem on one device.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TilingResult {
    pub block: BlockDimResult,
    pub single: SingleCoreShape,
    pub l1: L1Tile,
    pub l0: L0Tile,
    /// Present for [SplitLayout::HeightWidth] blocks, where `l1.m_al1` and `l0.m` are
    /// `ho * wo` products of these.
    pub spatial: Option<SpatialTiles>,
    pub double_buffer: DoubleBuffer,
    pub l1_mode: L1Mode,
    pub order: IterateOrder,
    pub bias_full_load: bool,
    pub scale_full_load: bool,
    /// Batches computed per pass through L0. 1 when disabled.
    pub inner_batch: u64,
    pub pad_compensation: bool,
    pub c04: bool,
    pub group_mode: GroupMode,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TileError {
    #[error("no {what} tile satisfies the alignment and capacity bounds")]
    EmptyRange { what: &'static str },
    #[error("minimal L1 tile needs {required} bytes, but L1 holds {capacity}")]
    MinimalTileOverflow { required: u64, capacity: u64 },
    #[error("{what} is not computable")]
    NotComputable { what: &'static str },
}

impl L1Mode {
    pub fn code(&self) -> u64 {
        match self {
            L1Mode::AllFullLoad => 0,
            L1Mode::FullLoadAl1 => 1,
            L1Mode::FullLoadBl1 => 2,
            L1Mode::NoneFullLoad => 3,
        }
    }

    fn fmap_full(&self) -> bool {
        matches!(self, L1Mode::AllFullLoad | L1Mode::FullLoadAl1)
    }

    fn weight_full(&self) -> bool {
        matches!(self, L1Mode::AllFullLoad | L1Mode::FullLoadBl1)
    }
}

impl IterateOrder {
    pub fn code(&self) -> u64 {
        match self {
            IterateOrder::MFirst => 0,
            IterateOrder::NFirst => 1,
        }
    }
}

impl Display for L1Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            L1Mode::AllFullLoad => "all-full",
            L1Mode::FullLoadAl1 => "full-al1",
            L1Mode::FullLoadBl1 => "full-bl1",
            L1Mode::NoneFullLoad => "streamed",
        };
        write!(f, "{s}")
    }
}

impl TilingResult {
    pub fn blocking(&self) -> &Blocking {
        &self.block.blocking
    }

    pub fn layout(&self) -> SplitLayout {
        self.block.layout
    }

    pub fn dispatch_key(&self) -> DispatchKey {
        DispatchKey::compose(self)
    }
}

fn bytes(terms: &[u64]) -> u64 {
    terms.iter().fold(1u64, |acc, &t| acc.saturating_mul(t))
}

/// Index into one of the four L1 tile ranges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum L1Dim {
    KA,
    KB,
    M,
    N,
}

/// Positions in the four L1 tile ranges.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct L1Indices([usize; 4]);

impl L1Indices {
    fn get(&self, dim: L1Dim) -> usize {
        self.0[dim as usize]
    }

    fn set(&mut self, dim: L1Dim, idx: usize) {
        self.0[dim as usize] = idx;
    }
}

/// L1 footprints that do not depend on the L1 tile choice.
#[derive(Clone, Copy, Debug, Default)]
struct L1Sizes {
    fmap_full: u64,
    weight_full: u64,
    fmap_min: u64,
    fmap_k_full: u64,
    weight_min: u64,
    weight_k_full: u64,
    bias_min: u64,
    bias_full: u64,
    scale_min: u64,
    scale_full: u64,
}

/// Extents of the block one core computes under `block`.
fn single_core_shape(dims: &ConvDims, block: &BlockDimResult) -> SingleCoreShape {
    let blocking = &block.blocking;
    let split = |extent: u64, axis: Axis| extent.div_ceil(u64::from(blocking[axis]));
    let (ho, wo, m) = match block.layout {
        SplitLayout::MergedSpatial => {
            let m0 = dims.cube.m0;
            let m1 = (dims.ho * dims.wo).div_ceil(m0);
            let m = (split(m1, Axis::M) * m0).min(dims.ho * dims.wo);
            (dims.ho, dims.wo, m)
        }
        SplitLayout::HeightWidth => {
            let ho = split(dims.ho, Axis::Ho);
            let wo = split(dims.wo, Axis::Wo);
            (ho, wo, ho * wo)
        }
    };
    SingleCoreShape {
        batch: split(dims.batch, Axis::Batch),
        groups: split(dims.cur_groups(), Axis::Group),
        dout: split(dims.dout, Axis::Dout),
        ho,
        wo,
        m,
        co1: split(dims.co1(), Axis::N),
    }
}

/// Derives tiles for a [SplitLayout::MergedSpatial] block, where output positions are
/// one flattened M axis.
struct TileDeriver<'a> {
    dims: &'a ConvDims,
    budget: &'a HardwareBudget,
    single: SingleCoreShape,
    inner_batch: u64,
    pb: DoubleBuffer,
    l0: L0Tile,
    sizes: L1Sizes,
    mode: L1Mode,
    ranges: [Vec<u64>; 4],
    bias_full_load: bool,
    scale_full_load: bool,
}

impl<'a> TileDeriver<'a> {
    fn new(dims: &'a ConvDims, budget: &'a HardwareBudget, single: SingleCoreShape) -> Self {
        let cube = dims.cube;
        TileDeriver {
            dims,
            budget,
            single,
            inner_batch: 1,
            pb: DoubleBuffer {
                al1: 1,
                bl1: 1,
                al0: 2,
                bl0: 2,
                cl0: 1,
            },
            l0: L0Tile {
                m: cube.m0,
                k: cube.k0,
                n: cube.n0,
            },
            sizes: L1Sizes::default(),
            mode: L1Mode::NoneFullLoad,
            ranges: Default::default(),
            bias_full_load: false,
            scale_full_load: false,
        }
    }

    fn kernel_area(&self) -> u64 {
        self.dims.kh * self.dims.kw
    }

    /// `kh * kw * k0`: the reduction extent of one input-channel block.
    fn ci0_hk_wk(&self) -> u64 {
        self.kernel_area() * self.dims.cube.k0
    }

    /// Input rows resident in L1 for an fmap tile of `m` output positions.
    fn hi_for_m(&self, m: u64) -> u64 {
        let ho = (m / self.single.wo + 2).min(self.single.ho);
        self.dims.infer_hi(ho)
    }

    fn channel_params(&self, n: u64) -> Result<(u64, u64), TileError> {
        channel_params_bytes(self.dims, n).ok_or(TileError::NotComputable {
            what: "bias and scale footprint",
        })
    }

    /// L1 bytes needed to feed one L0 tile of `m_l0 x n_l0`, reserving at least `reserve`
    /// bytes for the weight.
    fn l1_for_l0(&self, m_l0: u64, n_l0: u64, reserve: u64) -> Result<u64, TileError> {
        let d = self.dims;
        let fmap = bytes(&[self.hi_for_m(m_l0), d.wi, d.cube.k0, d.fmap_bytes, self.pb.al1]);
        let weight = bytes(&[n_l0, self.ci0_hk_wk(), d.weight_bytes, self.pb.bl1]).max(reserve);
        let (bias, scale) = self.channel_params(n_l0)?;
        Ok(fmap.saturating_add(weight).saturating_add(bias).saturating_add(scale))
    }

    fn init_ping_pong(&mut self) -> Result<(), TileError> {
        let (m0, n0) = (self.dims.cube.m0, self.dims.cube.n0);
        let l1 = self.budget.l1_bytes;
        self.pb.al1 = 2;
        self.pb.bl1 = 2;
        if self.l1_for_l0(m0, n0, self.budget.l0b_bytes)? > l1 {
            self.pb.bl1 = 1;
            if self.l1_for_l0(m0, n0, 0)? > l1 {
                self.pb.al1 = 1;
            }
        }
        self.pb = single_buffer_small_l0(self.dims, self.budget, self.pb);
        Ok(())
    }

    fn l0_fits(&self, m: u64, k: u64, n: u64) -> bool {
        let d = self.dims;
        bytes(&[m, k, self.pb.al0, d.fmap_bytes]) <= self.budget.l0a_bytes
            && bytes(&[k, n, self.pb.bl0, d.weight_bytes]) <= self.budget.l0b_bytes
            && bytes(&[m, n, self.pb.cl0, MAD_BYTES]) <= self.budget.l0c_bytes
    }

    fn l0_ranges(&self) -> Result<(Vec<u64>, Vec<u64>), TileError> {
        let d = self.dims;
        let b = self.budget;
        let cube = d.cube;
        let n_max = (b.l0b_bytes / (cube.k0 * self.pb.bl0 * d.weight_bytes))
            .min(b.l0c_bytes / (cube.m0 * self.pb.cl0 * MAD_BYTES));
        let n_range = factors_with_pow2(self.single.co1, n_max / cube.n0)
            .into_iter()
            .map(|f| f * cube.n0)
            .collect::<Vec<_>>();
        let m_max = (b.l0a_bytes / (cube.k0 * self.pb.al0 * d.fmap_bytes))
            .min(b.l0c_bytes / (cube.n0 * self.pb.cl0 * MAD_BYTES));
        let m_range = factors_with_pow2(self.single.m.div_ceil(cube.m0), m_max / cube.m0)
            .into_iter()
            .map(|f| f * cube.m0)
            .take_while(|&m| m <= b.limits.m_start_limit)
            .collect::<Vec<_>>();
        if n_range.is_empty() {
            return Err(TileError::EmptyRange { what: "nL0" });
        }
        if m_range.is_empty() {
            return Err(TileError::EmptyRange { what: "mL0" });
        }
        Ok((m_range, n_range))
    }

    /// Grow the L0 tile from the smallest candidates, favoring the shorter side.
    ///
    /// The smallest candidates are kept even when they overflow; whether L1 can hold the
    /// minimal tile at all is decided by [TileDeriver::check_min_l1].
    fn decide_l0(&mut self) -> Result<(), TileError> {
        let (m_range, n_range) = self.l0_ranges()?;
        let k = self.dims.cube.k0;
        let l1 = self.budget.l1_bytes;
        let fits = |this: &Self, m: u64, n: u64| -> Result<bool, TileError> {
            Ok(this.l0_fits(m, k, n) && this.l1_for_l0(m, n, 0)? <= l1)
        };
        let (mut mi, mut ni) = (0, 0);
        if !fits(self, m_range[0], n_range[0])? {
            debug!("smallest L0 tile overflows L1 while double-buffered");
            self.l0 = L0Tile {
                m: m_range[0],
                k,
                n: n_range[0],
            };
            return Ok(());
        }
        loop {
            let m_end = mi + 1 == m_range.len();
            let n_end = ni + 1 == n_range.len();
            if m_end && n_end {
                break;
            }
            let update_m = if m_range[mi] <= n_range[ni] {
                !m_end
            } else {
                n_end
            };
            if update_m {
                mi += 1;
            } else {
                ni += 1;
            }
            if !fits(self, m_range[mi], n_range[ni])? {
                if update_m {
                    mi -= 1;
                } else {
                    ni -= 1;
                }
                break;
            }
        }
        self.l0 = L0Tile {
            m: m_range[mi],
            k,
            n: n_range[ni],
        };
        Ok(())
    }

    /// Compute several batches per L0 pass when one core holds the whole spatial extent.
    fn decide_inner_batch(&mut self, blocking: &Blocking) -> Result<(), TileError> {
        let d = self.dims;
        let spatially_whole = blocking[Axis::M] == 1
            && blocking[Axis::Ho] == 1
            && blocking[Axis::Wo] == 1;
        if d.groups != 1 || d.is_3d() || !spatially_whole || self.single.batch <= 1 {
            return Ok(());
        }
        let b = self.budget;
        let L0Tile { m, k, n } = self.l0;
        let (bias, _) = self.channel_params(n)?;
        let weight = bytes(&[n, d.kh, d.kw, k, d.weight_bytes, 2]);
        let fmap_per_batch = bytes(&[d.wi, d.infer_hi(self.single.ho), k, d.fmap_bytes, 2]);
        let limits = [
            b.l0a_bytes / bytes(&[2, d.fmap_bytes, m, k]),
            b.l0c_bytes / bytes(&[m, n, MAD_BYTES, 2]),
            b.l1_bytes.saturating_sub(bias).saturating_sub(weight) / fmap_per_batch,
            self.single.batch,
        ];
        let Some(&ib) = limits.iter().min() else {
            return Ok(());
        };
        if ib == 0 {
            return Ok(());
        }
        let batch = self.single.batch;
        let mut ib = ib.min(batch.div_ceil(batch.div_ceil(ib)));
        while ib > 1 && self.min_l1_bytes(ib)? > b.l1_bytes {
            ib -= 1;
        }
        if ib > 1 {
            debug!("inner batch {ib} of {batch}");
            self.inner_batch = ib;
        }
        Ok(())
    }

    /// L1 bytes of the smallest tile: one fractal of output positions for `inner_batch`
    /// batches, one block of input channels, and one fractal of output channels, all
    /// single-buffered.
    fn min_l1_bytes(&self, inner_batch: u64) -> Result<u64, TileError> {
        let d = self.dims;
        let not_computable = TileError::NotComputable {
            what: "minimal L1 tile",
        };
        let fmap = bytes(&[
            inner_batch,
            self.hi_for_m(d.cube.m0),
            d.wi,
            d.cube.k0,
            d.fmap_bytes,
        ]);
        let fmap = align_up(fmap, C0_BYTES).ok_or(not_computable.clone())?;
        let weight = bytes(&[self.ci0_hk_wk(), d.cube.n0, d.weight_bytes]);
        let weight = align_up(weight, C0_BYTES).ok_or(not_computable)?;
        let (bias, scale) = self.channel_params(d.cube.n0)?;
        Ok(fmap.saturating_add(weight).saturating_add(bias).saturating_add(scale))
    }

    fn check_min_l1(&self) -> Result<(), TileError> {
        let required = self.min_l1_bytes(self.inner_batch)?;
        if required > self.budget.l1_bytes {
            return Err(TileError::MinimalTileOverflow {
                required,
                capacity: self.budget.l1_bytes,
            });
        }
        Ok(())
    }

    fn init_l1_sizes(&mut self) -> Result<(), TileError> {
        let d = self.dims;
        let ib = self.inner_batch;
        let pb = self.pb;
        let ci1 = d.ci1();
        let co = self.single.co1 * d.cube.n0;
        let (k_al1_full, k_bl1_full) = (ci1 * d.cube.k0, ci1 * self.ci0_hk_wk());
        let ho_full = (self.single.m / self.single.wo + 2).min(self.single.ho);
        let hi_min = self.hi_for_m(self.l0.m);
        let (bias_min, scale_min) = self.channel_params(self.l0.n)?;
        let (bias_full, scale_full) = self.channel_params(co)?;
        self.sizes = L1Sizes {
            fmap_full: bytes(&[d.kd, k_al1_full, d.infer_hi(ho_full), d.wi, d.fmap_bytes, ib]),
            weight_full: bytes(&[d.kd, k_bl1_full, co, d.weight_bytes]),
            fmap_min: bytes(&[d.cube.k0, hi_min, d.wi, d.fmap_bytes, pb.al1, ib]),
            fmap_k_full: bytes(&[d.kd, k_al1_full, hi_min, d.wi, pb.al1, d.fmap_bytes, ib]),
            // Streaming weight tiles keep at least one L0B of weight staged.
            weight_min: bytes(&[self.ci0_hk_wk(), self.l0.n, pb.bl1, d.weight_bytes])
                .max(self.budget.l0b_bytes),
            weight_k_full: bytes(&[d.kd, k_bl1_full, self.l0.n, pb.bl1, d.weight_bytes]),
            bias_min,
            bias_full,
            scale_min,
            scale_full,
        };
        Ok(())
    }

    fn init_l1_ranges(&mut self) -> Result<(), TileError> {
        let d = self.dims;
        let limits = &self.budget.limits;
        let cube = d.cube;
        let ci1 = d.ci1();
        let ci0_hk_wk = self.ci0_hk_wk();

        let mut k_base = factors(ci1, ci1);
        k_base.extend((2..=d.kd).map(|depth| depth * ci1));
        k_base.sort_unstable();
        k_base.dedup();
        let post_k_cap = (limits.post_k_limit + cube.k0) / ci0_hk_wk;
        let k_al1 = k_base
            .iter()
            .take_while(|&&k| k <= post_k_cap)
            .map(|&k| k * ci0_hk_wk)
            .filter(|&k| k <= limits.max_transfer_len)
            .collect::<Vec<_>>();
        let k_bl1 = k_base.iter().map(|&k| k * ci0_hk_wk).collect::<Vec<_>>();

        let L0Tile { m: m_l0, n: n_l0, .. } = self.l0;
        let n_bl1 = factors((self.single.co1 * cube.n0).div_ceil(n_l0), u64::MAX)
            .into_iter()
            .map(|f| f * n_l0)
            .collect::<Vec<_>>();
        let m_aligned =
            align_up(self.single.m, cube.m0).ok_or(TileError::NotComputable { what: "mAL1" })?;
        let m_al1 = factors(m_aligned.div_ceil(m_l0), u64::MAX)
            .into_iter()
            .map(|f| f * m_l0)
            .take_while(|&m| m <= limits.m_start_limit)
            .collect::<Vec<_>>();

        for (what, range) in [("kAL1", &k_al1), ("kBL1", &k_bl1), ("mAL1", &m_al1), ("nBL1", &n_bl1)] {
            if range.is_empty() {
                return Err(TileError::EmptyRange { what });
            }
        }
        self.ranges = [k_al1, k_bl1, m_al1, n_bl1];
        Ok(())
    }

    fn range(&self, dim: L1Dim) -> &[u64] {
        &self.ranges[dim as usize]
    }

    fn last(&self, dim: L1Dim) -> usize {
        self.range(dim).len() - 1
    }

    fn decide_l1_mode(&mut self) {
        let s = self.sizes;
        let l1 = self.budget.l1_bytes;
        let params = s.bias_min + s.scale_min;
        let m_aligned = self.single.m.div_ceil(self.dims.cube.m0) * self.dims.cube.m0;
        let m_exceeds = m_aligned > self.budget.limits.m_start_limit;
        let batch_loops = self.single.batch.div_ceil(self.inner_batch) > 1;
        let inner = self.inner_batch > 1;

        if s.fmap_full + s.weight_full + params <= l1 && !m_exceeds {
            self.pb.al1 = 1;
            self.mode = L1Mode::AllFullLoad;
            if inner && batch_loops {
                self.mode = L1Mode::FullLoadBl1;
                self.pb.al1 = 2;
            }
            return;
        }

        let weight_fits = s.fmap_min + s.weight_full + params <= l1;
        let fmap_fits = !m_exceeds && s.fmap_full + s.weight_min + params <= l1;
        let ratio = self.budget.weight_l1_bandwidth_ratio;
        self.mode = if s.fmap_full <= s.weight_full.saturating_mul(ratio) {
            if weight_fits {
                L1Mode::FullLoadBl1
            } else if fmap_fits {
                if inner {
                    self.pb.al1 = 2;
                    L1Mode::NoneFullLoad
                } else {
                    self.pb.al1 = 1;
                    L1Mode::FullLoadAl1
                }
            } else {
                L1Mode::NoneFullLoad
            }
        } else if fmap_fits {
            if inner {
                self.pb.al1 = 2;
                if weight_fits {
                    L1Mode::FullLoadBl1
                } else {
                    L1Mode::NoneFullLoad
                }
            } else {
                self.pb.al1 = 1;
                L1Mode::FullLoadAl1
            }
        } else if weight_fits {
            L1Mode::FullLoadBl1
        } else {
            L1Mode::NoneFullLoad
        };
    }

    fn l1_fits(&self, idx: &L1Indices) -> bool {
        let d = self.dims;
        let s = &self.sizes;
        let k_al1 = self.range(L1Dim::KA)[idx.get(L1Dim::KA)];
        let k_bl1 = self.range(L1Dim::KB)[idx.get(L1Dim::KB)];
        let m_al1 = self.range(L1Dim::M)[idx.get(L1Dim::M)];
        let n_bl1 = self.range(L1Dim::N)[idx.get(L1Dim::N)];

        let fmap = if self.mode.fmap_full() {
            s.fmap_full
        } else {
            bytes(&[
                k_al1 / self.kernel_area(),
                self.hi_for_m(m_al1),
                d.wi,
                d.fmap_bytes,
                self.pb.al1,
                self.inner_batch,
            ])
        };
        let weight = if self.mode.weight_full() {
            s.weight_full
        } else {
            bytes(&[k_bl1, self.pb.bl1, n_bl1, d.weight_bytes])
        };
        let bias = if self.bias_full_load {
            s.bias_full
        } else {
            s.bias_min
        };
        let scale = if self.scale_full_load {
            s.scale_full
        } else {
            s.scale_min
        };
        fmap.saturating_add(weight)
            .saturating_add(bias)
            .saturating_add(scale)
            <= self.budget.l1_bytes
    }

    /// Advance `dim` while the L1 check passes, stepping back on the first overflow.
    fn grow(&self, idx: &mut L1Indices, dim: L1Dim) {
        while idx.get(dim) < self.last(dim) {
            idx.set(dim, idx.get(dim) + 1);
            if !self.l1_fits(idx) {
                idx.set(dim, idx.get(dim) - 1);
                break;
            }
        }
    }

    /// Advance both reduction tiles in lockstep.
    fn grow_k_together(&self, idx: &mut L1Indices) {
        while idx.get(L1Dim::KA) < self.last(L1Dim::KA) && idx.get(L1Dim::KB) < self.last(L1Dim::KB)
        {
            let before = *idx;
            idx.set(L1Dim::KA, idx.get(L1Dim::KA) + 1);
            idx.set(L1Dim::KB, idx.get(L1Dim::KB) + 1);
            if !self.l1_fits(idx) {
                *idx = before;
                break;
            }
        }
    }

    /// Bytes moved into L1 for the whole block, given how often each operand is reloaded.
    fn reload_volume(&self, once: u64, reloaded: u64, reloads: u64) -> u64 {
        once.saturating_add(reloaded.saturating_mul(reloads))
    }

    fn fmap_k_full_iter(&self, mut idx: L1Indices) -> L1Indices {
        idx.set(L1Dim::KA, self.last(L1Dim::KA));
        self.grow(&mut idx, L1Dim::M);
        self.grow(&mut idx, L1Dim::KB);
        if idx.get(L1Dim::KB) == self.last(L1Dim::KB) {
            self.grow(&mut idx, L1Dim::N);
        }
        idx
    }

    fn weight_k_full_iter(&self, mut idx: L1Indices) -> L1Indices {
        idx.set(L1Dim::KB, self.last(L1Dim::KB));
        self.grow(&mut idx, L1Dim::N);
        self.grow(&mut idx, L1Dim::KA);
        if idx.get(L1Dim::KA) == self.last(L1Dim::KA) {
            self.grow(&mut idx, L1Dim::M);
        }
        idx
    }

    fn m_iters(&self, idx: &L1Indices) -> u64 {
        self.range(L1Dim::M)[self.last(L1Dim::M)].div_ceil(self.range(L1Dim::M)[idx.get(L1Dim::M)])
    }

    fn n_iters(&self, idx: &L1Indices) -> u64 {
        self.range(L1Dim::N)[self.last(L1Dim::N)].div_ceil(self.range(L1Dim::N)[idx.get(L1Dim::N)])
    }

    fn decide_streamed(&self) -> (L1Indices, IterateOrder) {
        let s = &self.sizes;
        let base = L1Indices::default();
        let with = |dims: &[L1Dim]| {
            let mut idx = base;
            for &dim in dims {
                idx.set(dim, self.last(dim));
            }
            idx
        };
        let ka_full = self.l1_fits(&with(&[L1Dim::KA]));
        let kb_full = self.l1_fits(&with(&[L1Dim::KB]));
        let both_full = self.l1_fits(&with(&[L1Dim::KA, L1Dim::KB]));

        if both_full {
            let start = with(&[L1Dim::KA, L1Dim::KB]);
            let mut m_first = start;
            self.grow(&mut m_first, L1Dim::N);
            let mut n_first = start;
            self.grow(&mut n_first, L1Dim::M);
            // N-first keeps an M block of fmap resident and reloads weight per M block.
            let n_first_volume =
                self.reload_volume(s.fmap_k_full, s.weight_k_full, self.m_iters(&n_first));
            let m_first_volume =
                self.reload_volume(s.weight_k_full, s.fmap_k_full, self.n_iters(&m_first));
            return if n_first_volume < m_first_volume {
                (n_first, IterateOrder::NFirst)
            } else {
                (m_first, IterateOrder::MFirst)
            };
        }
        match (ka_full, kb_full) {
            (true, true) => {
                let a = self.fmap_k_full_iter(base);
                let b = self.weight_k_full_iter(base);
                let a_volume = self.reload_volume(s.fmap_k_full, s.weight_k_full, self.m_iters(&a));
                let b_volume = self.reload_volume(s.weight_k_full, s.fmap_k_full, self.n_iters(&b));
                if a_volume < b_volume {
                    (a, IterateOrder::NFirst)
                } else {
                    (b, IterateOrder::MFirst)
                }
            }
            (true, false) => (self.fmap_k_full_iter(base), IterateOrder::NFirst),
            (false, true) => (self.weight_k_full_iter(base), IterateOrder::MFirst),
            (false, false) => {
                let mut idx = base;
                self.grow_k_together(&mut idx);
                (idx, IterateOrder::MFirst)
            }
        }
    }

    fn decide_l1(&self) -> (L1Indices, IterateOrder) {
        let mut idx = L1Indices::default();
        match self.mode {
            L1Mode::AllFullLoad => {
                for dim in [L1Dim::KA, L1Dim::KB, L1Dim::M, L1Dim::N] {
                    idx.set(dim, self.last(dim));
                }
                (idx, IterateOrder::MFirst)
            }
            L1Mode::FullLoadAl1 => {
                idx.set(L1Dim::KA, self.last(L1Dim::KA));
                idx.set(L1Dim::M, self.last(L1Dim::M));
                self.grow(&mut idx, L1Dim::KB);
                if idx.get(L1Dim::KB) == self.last(L1Dim::KB) {
                    self.grow(&mut idx, L1Dim::N);
                }
                (idx, IterateOrder::NFirst)
            }
            L1Mode::FullLoadBl1 => {
                idx.set(L1Dim::KB, self.last(L1Dim::KB));
                idx.set(L1Dim::N, self.last(L1Dim::N));
                self.grow(&mut idx, L1Dim::KA);
                if idx.get(L1Dim::KA) == self.last(L1Dim::KA) {
                    self.grow(&mut idx, L1Dim::M);
                }
                (idx, IterateOrder::MFirst)
            }
            L1Mode::NoneFullLoad => self.decide_streamed(),
        }
    }

    fn decide_channel_params(&mut self, idx: &L1Indices) {
        let d = self.dims;
        let co = self.single.co1 * d.cube.n0;
        if let Some(b) = d.bias_bytes {
            self.bias_full_load = true;
            if !self.l1_fits(idx) || co * b > self.budget.limits.max_burst_bytes {
                self.bias_full_load = false;
            }
        }
        if d.channel_wise_coeff > 0 && self.sizes.scale_full > 0 {
            self.scale_full_load = true;
            if !self.l1_fits(idx) {
                self.scale_full_load = false;
            }
        }
    }

    fn decide_k_l0(&mut self, k_al1: u64, k_bl1: u64) {
        let k0 = self.dims.cube.k0;
        let Some(g) = gcd(k_al1.div_ceil(k0), k_bl1.div_ceil(k0)) else {
            return;
        };
        let L0Tile { m, n, .. } = self.l0;
        if let Some(k) = factors(g, g)
            .into_iter()
            .rev()
            .map(|f| f * k0)
            .find(|&k| self.l0_fits(m, k, n))
        {
            self.l0.k = k;
        }
    }

    fn update_l1_double_buffer(&mut self, idx: &L1Indices) {
        if self.mode.fmap_full() {
            self.pb.al1 = 1;
        }
        if !self.mode.weight_full() {
            self.pb.bl1 = 2;
            if !self.l1_fits(idx) {
                self.pb.bl1 = 1;
            }
        } else {
            self.pb.bl1 = 1;
        }
    }

    fn update_l0_double_buffer(&mut self, k_full_extent: u64, order: IterateOrder) -> IterateOrder {
        let L0Tile { m, k, n } = self.l0;
        if m * n * MAD_BYTES <= self.budget.l0c_bytes / 2 {
            self.pb.cl0 = 2;
        }
        let k_full = k == k_full_extent;
        if k_full && self.single.m <= m {
            self.pb.al0 = 1;
        }
        if k_full && self.single.co1 * self.dims.cube.n0 <= n {
            self.pb.bl0 = 1;
        }
        if k_full && self.pb.al0 == 2 && self.pb.bl0 == 2 {
            match order {
                IterateOrder::MFirst => self.pb.bl0 = 1,
                IterateOrder::NFirst => self.pb.al0 = 1,
            }
        }
        match (self.pb.al0, self.pb.bl0) {
            (2, 1) => IterateOrder::MFirst,
            (1, 2) => IterateOrder::NFirst,
            _ => order,
        }
    }
}

fn pad_compensation(dims: &ConvDims, block: &BlockDimResult) -> bool {
    if block.layout != SplitLayout::HeightWidth {
        return false;
    }
    let pad = dims.pad;
    (block.blocking[Axis::Ho] > 1 && (pad.top > 0 || pad.bottom > 0))
        || (block.blocking[Axis::Wo] > 1 && (pad.left > 0 || pad.right > 0))
}

/// Drop L0A or L0B ping-pong when one fractal of that operand cannot be double-buffered.
fn single_buffer_small_l0(
    dims: &ConvDims,
    budget: &HardwareBudget,
    mut pb: DoubleBuffer,
) -> DoubleBuffer {
    let cube = dims.cube;
    if bytes(&[cube.m0, cube.k0, pb.al0, dims.fmap_bytes]) > budget.l0a_bytes {
        pb.al0 = 1;
    }
    if bytes(&[cube.k0, cube.n0, pb.bl0, dims.weight_bytes]) > budget.l0b_bytes {
        pb.bl0 = 1;
    }
    pb
}

/// Derive L1 and L0 tiles, buffering and iteration order for the block one core computes.
pub fn derive_tiling(
    dims: &ConvDims,
    budget: &HardwareBudget,
    block: &BlockDimResult,
) -> Result<TilingResult, TileError> {
    let single = single_core_shape(dims, block);
    match block.layout {
        SplitLayout::MergedSpatial => derive_merged(dims, budget, block, single),
        SplitLayout::HeightWidth => hw::derive(dims, budget, block, single),
    }
}

fn derive_merged(
    dims: &ConvDims,
    budget: &HardwareBudget,
    block: &BlockDimResult,
    single: SingleCoreShape,
) -> Result<TilingResult, TileError> {
    let mut deriver = TileDeriver::new(dims, budget, single);
    deriver.init_ping_pong()?;
    deriver.decide_l0()?;
    deriver.decide_inner_batch(&block.blocking)?;
    deriver.check_min_l1()?;
    deriver.init_l1_sizes()?;
    deriver.init_l1_ranges()?;
    deriver.decide_l1_mode();
    let (idx, order) = deriver.decide_l1();
    deriver.decide_channel_params(&idx);

    let [k_al1, k_bl1, m_al1, n_bl1] =
        [L1Dim::KA, L1Dim::KB, L1Dim::M, L1Dim::N].map(|dim| deriver.range(dim)[idx.get(dim)]);
    deriver.decide_k_l0(k_al1, k_bl1);
    deriver.update_l1_double_buffer(&idx);

    let cube = dims.cube;
    let mode = deriver.mode;
    let m_aligned =
        align_up(deriver.single.m, cube.m0).ok_or(TileError::NotComputable { what: "mAL1" })?;
    let l1 = L1Tile {
        k_al1,
        k_bl1,
        m_al1: if mode.fmap_full() { m_aligned } else { m_al1 },
        n_bl1: if mode.weight_full() {
            deriver.single.co1 * cube.n0
        } else {
            n_bl1
        },
    };
    let k_full_extent = dims.kd * dims.ci1() * deriver.ci0_hk_wk();
    let order = deriver.update_l0_double_buffer(k_full_extent, order);
    debug!(
        "{mode} tiling: L1 {l1:?}, L0 {:?}, buffers {:?}, {order:?}",
        deriver.l0, deriver.pb
    );

    Ok(TilingResult {
        block: *block,
        single: deriver.single,
        l1,
        l0: deriver.l0,
        spatial: None,
        double_buffer: deriver.pb,
        l1_mode: mode,
        order,
        bias_full_load: deriver.bias_full_load,
        scale_full_load: deriver.scale_full_load,
        inner_batch: deriver.inner_batch,
        pad_compensation: false,
        c04: false,
        group_mode: dims.group_mode,
    })
}
