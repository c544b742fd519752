use serde::{Deserialize, Serialize};
use std::fmt::Display;

use crate::common::{CubeShape, DimSize, Dtype, C04_CIN};
use crate::utils::{align_up, ceil_div, lcm};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum OpKind {
    Conv1d,
    Conv2d,
    Conv3d,
    /// A matrix multiplication, modeled as a 1x1 convolution over an `M x 1` image.
    Matmul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum FmapFormat {
    Nchw,
    Nhwc,
    Ncdhw,
    Ndhwc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum WeightFormat {
    Nd,
    /// Pre-blocked into cube fractals.
    Fractal,
}

/// Per-side padding, in input elements.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Padding {
    pub head: u32,
    pub tail: u32,
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

/// A normalized convolution or matmul problem.
///
/// Spatial triples (`input`, `kernel`, `stride`, `dilation`) are ordered depth, height, width.
/// Axes the operator does not have are 1.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ProblemShape {
    pub kind: OpKind,
    pub batch: DimSize,
    pub in_channels: DimSize,
    pub out_channels: DimSize,
    pub input: [DimSize; 3],
    pub kernel: [DimSize; 3],
    pub stride: [DimSize; 3],
    pub dilation: [DimSize; 3],
    pub pad: Padding,
    pub groups: DimSize,
    pub fmap_format: FmapFormat,
    pub weight_format: WeightFormat,
    pub fmap_dtype: Dtype,
    pub weight_dtype: Dtype,
    pub bias_dtype: Option<Dtype>,
    pub output_dtype: Dtype,
    /// Number of per-channel fixpipe parameters (e.g. quantization scale and offset).
    pub channel_wise_coeff: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum GroupMode {
    Normal,
    /// Each group is searched on its own per-group extents.
    Original { ci_per_group: u64, co_per_group: u64 },
    /// Groups are merged `enlarge` at a time so each merged group fills whole cube fractals.
    Optimized {
        enlarge: u64,
        group_opt: u64,
        cin_opt: u64,
        cout_opt: u64,
    },
}

/// Every extent and attribute of a [ProblemShape] the cost, capacity and tiling models read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConvDims {
    pub kind: OpKind,
    pub fmap_format: FmapFormat,
    pub weight_format: WeightFormat,
    pub fmap_dtype: Dtype,
    pub batch: u64,
    pub ci: u64,
    pub co: u64,
    pub di: u64,
    pub hi: u64,
    pub wi: u64,
    pub dout: u64,
    pub ho: u64,
    pub wo: u64,
    pub kd: u64,
    pub kh: u64,
    pub kw: u64,
    pub stride_h: u64,
    pub stride_w: u64,
    pub dilation_d: u64,
    pub dilation_h: u64,
    pub dilation_w: u64,
    pub pad: Padding,
    pub groups: u64,
    pub group_mode: GroupMode,
    pub cube: CubeShape,
    /// Small-channel layout: channels padded to a block of 4 instead of `k0`.
    pub c04: bool,
    pub fmap_bytes: u64,
    pub weight_bytes: u64,
    pub bias_bytes: Option<u64>,
    pub channel_wise_coeff: u64,
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ShapeError {
    #[error("{axis} output extent is empty for input {input}, kernel {kernel} and stride {stride}")]
    EmptyOutput {
        axis: &'static str,
        input: u32,
        kernel: u32,
        stride: u32,
    },
    #[error("{what} ({extent}) is not divisible by groups ({groups})")]
    GroupMismatch {
        what: &'static str,
        extent: u32,
        groups: u32,
    },
    #[error("{kind:?} does not accept fmap format {format:?}")]
    FormatMismatch { kind: OpKind, format: FmapFormat },
}

impl ProblemShape {
    fn new(
        kind: OpKind,
        batch: DimSize,
        in_channels: DimSize,
        out_channels: DimSize,
        input: [DimSize; 3],
        kernel: [DimSize; 3],
        fmap_format: FmapFormat,
    ) -> Self {
        ProblemShape {
            kind,
            batch,
            in_channels,
            out_channels,
            input,
            kernel,
            stride: [DimSize::MIN; 3],
            dilation: [DimSize::MIN; 3],
            pad: Padding::default(),
            groups: DimSize::MIN,
            fmap_format,
            weight_format: WeightFormat::Nd,
            fmap_dtype: Dtype::Float16,
            weight_dtype: Dtype::Float16,
            bias_dtype: None,
            output_dtype: Dtype::Float16,
            channel_wise_coeff: 0,
        }
    }

    pub fn conv1d(
        batch: DimSize,
        in_channels: DimSize,
        out_channels: DimSize,
        width: DimSize,
        kernel: DimSize,
    ) -> Self {
        let one = DimSize::MIN;
        Self::new(
            OpKind::Conv1d,
            batch,
            in_channels,
            out_channels,
            [one, one, width],
            [one, one, kernel],
            FmapFormat::Nchw,
        )
    }

    pub fn conv2d(
        batch: DimSize,
        in_channels: DimSize,
        out_channels: DimSize,
        [height, width]: [DimSize; 2],
        [kernel_h, kernel_w]: [DimSize; 2],
    ) -> Self {
        let one = DimSize::MIN;
        Self::new(
            OpKind::Conv2d,
            batch,
            in_channels,
            out_channels,
            [one, height, width],
            [one, kernel_h, kernel_w],
            FmapFormat::Nchw,
        )
    }

    pub fn conv3d(
        batch: DimSize,
        in_channels: DimSize,
        out_channels: DimSize,
        input: [DimSize; 3],
        kernel: [DimSize; 3],
    ) -> Self {
        Self::new(
            OpKind::Conv3d,
            batch,
            in_channels,
            out_channels,
            input,
            kernel,
            FmapFormat::Ncdhw,
        )
    }

    /// An `m x k` by `k x n` matrix multiplication.
    pub fn matmul(m: DimSize, k: DimSize, n: DimSize) -> Self {
        let one = DimSize::MIN;
        Self::new(
            OpKind::Matmul,
            one,
            k,
            n,
            [one, m, one],
            [one, one, one],
            FmapFormat::Nhwc,
        )
    }

    pub fn with_stride(mut self, stride: [DimSize; 3]) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_dilation(mut self, dilation: [DimSize; 3]) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_pad(mut self, pad: Padding) -> Self {
        self.pad = pad;
        self
    }

    pub fn with_groups(mut self, groups: DimSize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_format(mut self, fmap_format: FmapFormat, weight_format: WeightFormat) -> Self {
        self.fmap_format = fmap_format;
        self.weight_format = weight_format;
        self
    }

    /// Sets the fmap, weight, and output types. Bias, if any, is left unchanged.
    pub fn with_dtypes(mut self, fmap: Dtype, weight: Dtype, output: Dtype) -> Self {
        self.fmap_dtype = fmap;
        self.weight_dtype = weight;
        self.output_dtype = output;
        self
    }

    pub fn with_bias(mut self, bias: Dtype) -> Self {
        self.bias_dtype = Some(bias);
        self
    }

    pub fn with_channel_wise_coeff(mut self, coeff: u32) -> Self {
        self.channel_wise_coeff = coeff;
        self
    }

    pub fn is_3d(&self) -> bool {
        matches!(self.fmap_format, FmapFormat::Ncdhw | FmapFormat::Ndhwc)
    }

    /// Normalize into the extents the search and tiling models consume.
    pub fn dims(&self) -> Result<ConvDims, ShapeError> {
        if (self.kind == OpKind::Conv3d) != self.is_3d() {
            return Err(ShapeError::FormatMismatch {
                kind: self.kind,
                format: self.fmap_format,
            });
        }

        let groups = self.groups.get();
        for (what, extent) in [
            ("in_channels", self.in_channels.get()),
            ("out_channels", self.out_channels.get()),
        ] {
            if extent % groups != 0 {
                return Err(ShapeError::GroupMismatch {
                    what,
                    extent,
                    groups,
                });
            }
        }

        let pads = [
            ("depth", self.pad.head, self.pad.tail),
            ("height", self.pad.top, self.pad.bottom),
            ("width", self.pad.left, self.pad.right),
        ];
        let mut out = [0u64; 3];
        for (i, (axis, pad_a, pad_b)) in pads.into_iter().enumerate() {
            out[i] = output_extent(
                axis,
                self.input[i].get(),
                self.kernel[i].get(),
                self.stride[i].get(),
                self.dilation[i].get(),
                pad_a,
                pad_b,
            )?;
        }
        let [dout, ho, wo] = out;

        let cube = CubeShape {
            m0: self.fmap_dtype.cube().m0,
            k0: self.weight_dtype.cube().k0,
            n0: self.fmap_dtype.cube().n0,
        };
        let ci = u64::from(self.in_channels.get());
        let co = u64::from(self.out_channels.get());
        let group_mode = group_mode(ci, co, u64::from(groups), cube);
        let c04 = self.kind == OpKind::Conv2d
            && self.fmap_format == FmapFormat::Nhwc
            && groups == 1
            && ci <= C04_CIN
            && self.fmap_dtype.is_16_bit();

        Ok(ConvDims {
            kind: self.kind,
            fmap_format: self.fmap_format,
            weight_format: self.weight_format,
            fmap_dtype: self.fmap_dtype,
            batch: u64::from(self.batch.get()),
            ci,
            co,
            di: u64::from(self.input[0].get()),
            hi: u64::from(self.input[1].get()),
            wi: u64::from(self.input[2].get()),
            dout,
            ho,
            wo,
            kd: u64::from(self.kernel[0].get()),
            kh: u64::from(self.kernel[1].get()),
            kw: u64::from(self.kernel[2].get()),
            stride_h: u64::from(self.stride[1].get()),
            stride_w: u64::from(self.stride[2].get()),
            dilation_d: u64::from(self.dilation[0].get()),
            dilation_h: u64::from(self.dilation[1].get()),
            dilation_w: u64::from(self.dilation[2].get()),
            pad: self.pad,
            groups: u64::from(groups),
            group_mode,
            cube,
            c04,
            fmap_bytes: self.fmap_dtype.size(),
            weight_bytes: self.weight_dtype.size(),
            bias_bytes: self.bias_dtype.map(|d| d.size()),
            channel_wise_coeff: u64::from(self.channel_wise_coeff),
        })
    }
}

impl Display for ProblemShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [d, h, w] = self.input;
        let [kd, kh, kw] = self.kernel;
        write!(
            f,
            "{:?}(n={}, ci={}, co={}, in={}x{}x{}, k={}x{}x{}, g={}, {:?}, {})",
            self.kind,
            self.batch,
            self.in_channels,
            self.out_channels,
            d,
            h,
            w,
            kd,
            kh,
            kw,
            self.groups,
            self.fmap_format,
            self.fmap_dtype
        )
    }
}

fn output_extent(
    axis: &'static str,
    input: u32,
    kernel: u32,
    stride: u32,
    dilation: u32,
    pad_a: u32,
    pad_b: u32,
) -> Result<u64, ShapeError> {
    let padded = u64::from(input) + u64::from(pad_a) + u64::from(pad_b);
    let window = u64::from(dilation) * (u64::from(kernel) - 1) + 1;
    if padded < window {
        return Err(ShapeError::EmptyOutput {
            axis,
            input,
            kernel,
            stride,
        });
    }
    Ok((padded - window) / u64::from(stride) + 1)
}

fn group_mode(ci: u64, co: u64, groups: u64, cube: CubeShape) -> GroupMode {
    if groups == 1 {
        return GroupMode::Normal;
    }
    let ci_per_group = ci / groups;
    let co_per_group = co / groups;
    let enlarge = match (
        lcm(ci_per_group, cube.k0).map(|l| l / ci_per_group),
        lcm(co_per_group, cube.n0).map(|l| l / co_per_group),
    ) {
        (Some(a), Some(b)) => a.min(b).min(groups),
        _ => 1,
    };
    if enlarge <= 1 {
        return GroupMode::Original {
            ci_per_group,
            co_per_group,
        };
    }
    match (
        ceil_div(groups, enlarge),
        align_up(ci_per_group * enlarge, cube.k0),
        align_up(co_per_group * enlarge, cube.n0),
    ) {
        (Some(group_opt), Some(cin_opt), Some(cout_opt)) => GroupMode::Optimized {
            enlarge,
            group_opt,
            cin_opt,
            cout_opt,
        },
        _ => GroupMode::Original {
            ci_per_group,
            co_per_group,
        },
    }
}

impl ConvDims {
    /// Input channels of one searched group.
    pub fn cur_ci(&self) -> u64 {
        match self.group_mode {
            GroupMode::Normal => self.ci,
            GroupMode::Original { ci_per_group, .. } => ci_per_group,
            GroupMode::Optimized { cin_opt, .. } => cin_opt,
        }
    }

    /// Output channels of one searched group.
    pub fn cur_co(&self) -> u64 {
        match self.group_mode {
            GroupMode::Normal => self.co,
            GroupMode::Original { co_per_group, .. } => co_per_group,
            GroupMode::Optimized { cout_opt, .. } => cout_opt,
        }
    }

    /// Number of groups the search distributes.
    pub fn cur_groups(&self) -> u64 {
        match self.group_mode {
            GroupMode::Optimized { group_opt, .. } => group_opt,
            _ => self.groups,
        }
    }

    pub fn ci1(&self) -> u64 {
        self.cur_ci().div_ceil(self.cube.k0)
    }

    pub fn co1(&self) -> u64 {
        self.cur_co().div_ceil(self.cube.n0)
    }

    pub fn is_3d(&self) -> bool {
        matches!(self.fmap_format, FmapFormat::Ncdhw | FmapFormat::Ndhwc)
    }

    pub fn is_optimized_group(&self) -> bool {
        matches!(self.group_mode, GroupMode::Optimized { .. })
    }

    /// Input rows needed to produce `ho_tile` output rows, clamped to the input height.
    pub fn infer_hi(&self, ho_tile: u64) -> u64 {
        let kh_dilated = (self.kh - 1) * self.dilation_h + 1;
        (ho_tile.saturating_sub(1) * self.stride_h + kh_dilated).min(self.hi)
    }

    /// Input columns needed to produce `wo_tile` output columns, clamped to the input width.
    pub fn infer_wi(&self, wo_tile: u64) -> u64 {
        let kw_dilated = (self.kw - 1) * self.dilation_w + 1;
        (wo_tile.saturating_sub(1) * self.stride_w + kw_dilated).min(self.wi)
    }
}
