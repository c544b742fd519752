use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::ops::{Index, IndexMut};
use strum::{EnumCount, EnumIter, IntoEnumIterator};

pub const AXIS_COUNT: usize = Axis::COUNT;

/// The logical axes a block-dimension search may split across cores.
///
/// Declaration order is the order in which the search enumerates axes.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, EnumIter, EnumCount,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Axis {
    Batch,
    /// Flattened output spatial axis, in fractal rows. Only split by the merged-spatial layout.
    M,
    Ho,
    Wo,
    N,
    Dout,
    Group,
}

/// Number of blocks along every [Axis]. Unsplit axes hold 1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Blocking([u32; AXIS_COUNT]);

impl Axis {
    pub fn short_name(&self) -> &'static str {
        match self {
            Axis::Batch => "batch",
            Axis::M => "m",
            Axis::Ho => "ho",
            Axis::Wo => "wo",
            Axis::N => "n",
            Axis::Dout => "do",
            Axis::Group => "group",
        }
    }
}

impl Blocking {
    pub fn ones() -> Self {
        Blocking([1; AXIS_COUNT])
    }

    pub fn from_counts(counts: [u32; AXIS_COUNT]) -> Self {
        Blocking(counts)
    }

    pub fn with(mut self, axis: Axis, count: u32) -> Self {
        self[axis] = count;
        self
    }

    /// The number of cores this blocking occupies.
    pub fn product(&self) -> u64 {
        self.0.iter().map(|&c| u64::from(c)).product()
    }

    pub fn counts(&self) -> &[u32; AXIS_COUNT] {
        &self.0
    }
}

impl Default for Blocking {
    fn default() -> Self {
        Self::ones()
    }
}

impl Index<Axis> for Blocking {
    type Output = u32;

    fn index(&self, axis: Axis) -> &Self::Output {
        &self.0[axis as usize]
    }
}

impl IndexMut<Axis> for Blocking {
    fn index_mut(&mut self, axis: Axis) -> &mut Self::Output {
        &mut self.0[axis as usize]
    }
}

impl Display for Blocking {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for axis in Axis::iter() {
            if self[axis] == 1 {
                continue;
            }
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{}={}", axis.short_name(), self[axis])?;
            first = false;
        }
        if first {
            write!(f, "unsplit")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_and_display() {
        let b = Blocking::ones().with(Axis::Batch, 2).with(Axis::N, 8);
        assert_eq!(b.product(), 16);
        assert_eq!(b.to_string(), "batch=2 n=8");
        assert_eq!(Blocking::ones().to_string(), "unsplit");
    }
}
