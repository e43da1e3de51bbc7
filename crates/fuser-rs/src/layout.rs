//! Tensor layout helpers.
//!
//! Memory-format queries mirror the dense orderings used by eager frameworks: row-major
//! contiguous, channels-last for 4-D tensors and channels-last-3d for 5-D tensors. The
//! normalization layers permute between `[N, C, spatial...]` and the canonical
//! `[N, spatial..., C]` order with the permutation helpers below.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    Contiguous,
    /// `[N, C, H, W]` stored as `[N, H, W, C]`.
    ChannelsLast,
    /// `[N, C, D, H, W]` stored as `[N, D, H, W, C]`.
    ChannelsLast3d,
}

impl MemoryFormat {
    /// Axes ordered from innermost to outermost, or `None` when the format does not apply to
    /// tensors of this rank.
    fn dim_order(self, rank: usize) -> Option<Vec<usize>> {
        match self {
            MemoryFormat::Contiguous => Some((0..rank).rev().collect()),
            MemoryFormat::ChannelsLast if rank == 4 => Some(vec![1, 3, 2, 0]),
            MemoryFormat::ChannelsLast3d if rank == 5 => Some(vec![1, 4, 3, 2, 0]),
            _ => None,
        }
    }

    /// Dense strides (in elements) laying out `sizes` in this format.
    pub fn strides_for(self, sizes: &[usize]) -> Option<Vec<usize>> {
        let order = self.dim_order(sizes.len())?;
        let mut strides = vec![0usize; sizes.len()];
        let mut expected = 1usize;
        for axis in order {
            strides[axis] = expected;
            expected *= sizes[axis].max(1);
        }
        Some(strides)
    }

    /// Whether a `(sizes, strides)` view is dense in this format.
    ///
    /// Size-1 axes never constrain the answer, so a `[N, 1, H, W]` tensor that is contiguous is
    /// also reported as channels-last.
    pub fn is_satisfied_by(self, sizes: &[usize], strides: &[usize]) -> bool {
        let Some(order) = self.dim_order(sizes.len()) else {
            return false;
        };
        if sizes.iter().any(|&size| size == 0) {
            return true;
        }
        let mut expected = 1usize;
        for axis in order {
            let size = sizes[axis];
            if size == 1 {
                continue;
            }
            if strides[axis] != expected {
                return false;
            }
            expected *= size;
        }
        true
    }
}

/// Row-major strides for `sizes`.
pub fn contiguous_strides(sizes: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; sizes.len()];
    let mut acc = 1usize;
    for axis in (0..sizes.len()).rev() {
        strides[axis] = acc;
        acc *= sizes[axis].max(1);
    }
    strides
}

/// Permutation taking `[N, C, spatial...]` to `[N, spatial..., C]`.
pub fn channels_last_permutation(rank: usize) -> Vec<usize> {
    if rank < 2 {
        return (0..rank).collect();
    }
    let mut perm = Vec::with_capacity(rank);
    perm.push(0);
    perm.extend(2..rank);
    perm.push(1);
    perm
}

/// Inverse of [`channels_last_permutation`].
pub fn channels_first_permutation(rank: usize) -> Vec<usize> {
    if rank < 2 {
        return (0..rank).collect();
    }
    let mut perm = Vec::with_capacity(rank);
    perm.push(0);
    perm.push(rank - 1);
    perm.extend(1..rank - 1);
    perm
}

/// Per-axis contiguity flags for a strided view.
///
/// Size-1 axes are broadcast axes and report `None`. Every other axis reports whether its
/// stride equals the extent-weighted stride of the next inner non-broadcast axis; the innermost
/// non-broadcast axis is contiguous iff its stride is 1.
pub fn compute_contiguity(sizes: &[usize], strides: &[usize]) -> Vec<Option<bool>> {
    debug_assert_eq!(sizes.len(), strides.len());
    let mut contiguity = vec![None; sizes.len()];
    let mut inner: Option<usize> = None;
    for axis in (0..sizes.len()).rev() {
        if sizes[axis] == 1 {
            continue;
        }
        let dense = match inner {
            None => strides[axis] == 1,
            Some(prev) => strides[axis] == strides[prev] * sizes[prev],
        };
        contiguity[axis] = Some(dense);
        inner = Some(axis);
    }
    contiguity
}
