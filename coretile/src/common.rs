use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZeroU32;

pub type DimSize = NonZeroU32;

/// Byte quantum to which every buffer footprint is aligned.
pub const C0_BYTES: u64 = 32;

/// Bytes of the accumulator element in L0C.
pub const MAD_BYTES: u64 = 4;

/// Per-channel fixpipe parameters are stored at this width.
pub const SCALE_PARAM_BYTES: u64 = 2;

/// Channel block size used by the small-channel layout.
pub const C04_CIN: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum Dtype {
    Int8,
    Uint8,
    Float16,
    Bfloat16,
    Float32,
    Int32,
}

/// The shape of one fractal matrix the cube unit consumes per instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct CubeShape {
    pub m0: u64,
    pub k0: u64,
    pub n0: u64,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub const fn size(&self) -> u64 {
        match self {
            Dtype::Int8 | Dtype::Uint8 => 1,
            Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Float32 | Dtype::Int32 => 4,
        }
    }

    /// The cube fractal for operands of this type. `k0` always spans [C0_BYTES].
    pub const fn cube(&self) -> CubeShape {
        CubeShape {
            m0: 16,
            k0: C0_BYTES / self.size(),
            n0: 16,
        }
    }

    pub const fn is_16_bit(&self) -> bool {
        matches!(self, Dtype::Float16 | Dtype::Bfloat16)
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Int8 => write!(f, "i8"),
            Dtype::Uint8 => write!(f, "u8"),
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Int32 => write!(f, "i32"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cube_k0_by_dtype() {
        assert_eq!(Dtype::Float16.cube().k0, 16);
        assert_eq!(Dtype::Float32.cube().k0, 8);
        assert_eq!(Dtype::Int8.cube().k0, 32);
    }

    proptest! {
        #[test]
        fn test_cube_k0_spans_c0(dtype in any::<Dtype>()) {
            let cube = dtype.cube();
            prop_assert_eq!(cube.k0 * dtype.size(), C0_BYTES);
            prop_assert_eq!(cube.m0, cube.n0);
        }
    }
}
