use divrem::DivRem;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::problem::GroupMode;
use crate::tiling::TilingResult;

/// Number of decimal digit fields in a [DispatchKey].
const FIELD_COUNT: usize = 11;

/// A numeric code selecting the precompiled kernel variant for a tiling decision.
///
/// Each field occupies one decimal digit. Reading left to right: split layout, L1 mode,
/// iteration order, AL1/BL1/CL0 buffer counts, bias and scale full load, small-channel
/// layout, group mode, and inner batch. A leading 1 keeps leading-zero fields intact.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct DispatchKey(u64);

/// The decoded fields of a [DispatchKey].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchFields {
    pub layout: u8,
    pub l1_mode: u8,
    pub order: u8,
    pub pb_al1: u8,
    pub pb_bl1: u8,
    pub pb_cl0: u8,
    pub bias_full_load: bool,
    pub scale_full_load: bool,
    pub c04: bool,
    pub group_mode: u8,
    pub inner_batch: bool,
}

fn group_mode_code(mode: &GroupMode) -> u64 {
    match mode {
        GroupMode::Normal => 0,
        GroupMode::Original { .. } => 1,
        GroupMode::Optimized { .. } => 2,
    }
}

impl DispatchKey {
    pub fn compose(tiling: &TilingResult) -> Self {
        let pb = &tiling.double_buffer;
        let digits: [u64; FIELD_COUNT] = [
            tiling.layout().code(),
            tiling.l1_mode.code(),
            tiling.order.code(),
            pb.al1,
            pb.bl1,
            pb.cl0,
            u64::from(tiling.bias_full_load),
            u64::from(tiling.scale_full_load),
            u64::from(tiling.c04),
            group_mode_code(&tiling.group_mode),
            u64::from(tiling.inner_batch > 1),
        ];
        DispatchKey(digits.iter().fold(1, |key, &d| key * 10 + d))
    }

    pub fn fields(&self) -> DispatchFields {
        let mut digits = [0u8; FIELD_COUNT];
        let mut rest = self.0;
        for slot in digits.iter_mut().rev() {
            let (q, r) = rest.div_rem(10);
            *slot = r as u8;
            rest = q;
        }
        DispatchFields {
            layout: digits[0],
            l1_mode: digits[1],
            order: digits[2],
            pb_al1: digits[3],
            pb_bl1: digits[4],
            pb_cl0: digits[5],
            bias_full_load: digits[6] == 1,
            scale_full_load: digits[7] == 1,
            c04: digits[8] == 1,
            group_mode: digits[9],
            inner_batch: digits[10] == 1,
        }
    }
}

impl Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan;
    use crate::problem::ProblemShape;
    use crate::target::HardwareBudget;
    use nonzero::nonzero as nz;

    #[test]
    fn test_key_carries_every_field() {
        let problem = ProblemShape::conv2d(
            nz!(1u32),
            nz!(16u32),
            nz!(16u32),
            [nz!(8u32), nz!(8u32)],
            [nz!(3u32), nz!(3u32)],
        )
        .with_groups(nz!(2u32));
        let tiling = plan(&problem, &HardwareBudget::default()).unwrap();
        let key = tiling.dispatch_key();
        let fields = key.fields();
        assert_eq!(u64::from(fields.layout), tiling.layout().code());
        assert_eq!(u64::from(fields.l1_mode), tiling.l1_mode.code());
        assert_eq!(u64::from(fields.order), tiling.order.code());
        assert_eq!(u64::from(fields.pb_al1), tiling.double_buffer.al1);
        assert_eq!(u64::from(fields.pb_bl1), tiling.double_buffer.bl1);
        assert_eq!(u64::from(fields.pb_cl0), tiling.double_buffer.cl0);
        assert_eq!(fields.group_mode, 2);
        assert!(!fields.c04);
        assert!(!fields.inner_batch);
    }

    #[test]
    fn test_key_has_fixed_width() {
        let problem = ProblemShape::matmul(nz!(256u32), nz!(64u32), nz!(64u32));
        let key = plan(&problem, &HardwareBudget::default())
            .unwrap()
            .dispatch_key();
        assert_eq!(key.to_string().len(), FIELD_COUNT + 1);
        assert!(key.to_string().starts_with('1'));
    }
}
