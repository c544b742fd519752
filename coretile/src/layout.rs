use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use strum::EnumIter;

/// How output spatial extents are distributed across cores.
///
/// Variants are listed in order of preference: ties in cost go to the earlier layout.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize, EnumIter,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum SplitLayout {
    /// Output height and width are flattened into one M axis and split in fractal rows.
    MergedSpatial,
    /// Output height (and, for 1-D convolution, width) are split as-is.
    HeightWidth,
}

impl SplitLayout {
    pub fn code(&self) -> u64 {
        match self {
            SplitLayout::MergedSpatial => 0,
            SplitLayout::HeightWidth => 1,
        }
    }
}

impl Display for SplitLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitLayout::MergedSpatial => write!(f, "M"),
            SplitLayout::HeightWidth => write!(f, "HW"),
        }
    }
}
