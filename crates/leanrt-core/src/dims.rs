//! Fixed-capacity tensor shapes with wildcard dimensions.

use std::fmt;

use leanrt_kernels::WILDCARD;

/// Maximum tensor rank.
pub const MAX_DIMS: usize = 8;

/// Shape of a tensor.
///
/// `nb_dims == -1` is the sentinel returned for names that are not IO
/// tensors. A dimension equal to `-1` is a wildcard that is only known once
/// input shapes are supplied.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dims {
    pub nb_dims: i32,
    pub d: [i64; MAX_DIMS],
}

impl Dims {
    /// Sentinel for unknown tensors.
    pub const UNKNOWN: Dims = Dims {
        nb_dims: -1,
        d: [0; MAX_DIMS],
    };

    /// Build dims from a slice. Returns `None` above `MAX_DIMS`.
    pub fn new(dims: &[i64]) -> Option<Self> {
        if dims.len() > MAX_DIMS {
            return None;
        }
        let mut d = [0; MAX_DIMS];
        d[..dims.len()].copy_from_slice(dims);
        Some(Self {
            nb_dims: dims.len() as i32,
            d,
        })
    }

    /// Whether this is the unknown-tensor sentinel.
    pub fn is_unknown(&self) -> bool {
        self.nb_dims < 0
    }

    /// Rank, or `None` for the sentinel.
    pub fn rank(&self) -> Option<usize> {
        usize::try_from(self.nb_dims).ok().map(|n| n.min(MAX_DIMS))
    }

    /// The dimensions in use. Empty for the sentinel.
    pub fn as_slice(&self) -> &[i64] {
        &self.d[..self.rank().unwrap_or(0)]
    }

    /// Whether any dimension is a wildcard.
    pub fn has_wildcards(&self) -> bool {
        self.as_slice().contains(&WILDCARD)
    }

    /// Whether every dimension is known.
    pub fn is_resolved(&self) -> bool {
        !self.is_unknown() && self.as_slice().iter().all(|&d| d >= 0)
    }

    /// Dimensions as sizes, if fully resolved.
    pub fn to_sizes(&self) -> Option<Vec<usize>> {
        if !self.is_resolved() {
            return None;
        }
        Some(self.as_slice().iter().map(|&d| d as usize).collect())
    }

    /// Number of elements, if fully resolved.
    pub fn volume(&self) -> Option<usize> {
        self.to_sizes()
            .and_then(|sizes| leanrt_kernels::element_count(&sizes))
    }
}

impl fmt::Debug for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return f.write_str("unknown");
        }
        f.write_str("[")?;
        for (i, d) in self.as_slice().iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if *d == WILDCARD {
                f.write_str("?")?;
            } else {
                write!(f, "{}", d)?;
            }
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_sentinel() {
        assert!(Dims::UNKNOWN.is_unknown());
        assert_eq!(Dims::UNKNOWN.rank(), None);
        assert!(Dims::UNKNOWN.as_slice().is_empty());
        assert!(!Dims::UNKNOWN.is_resolved());
        assert_eq!(Dims::UNKNOWN.to_string(), "unknown");
    }

    #[test]
    fn test_wildcards() {
        let dims = Dims::new(&[-1, 3, 224]).unwrap();
        assert!(dims.has_wildcards());
        assert_eq!(dims.volume(), None);
        assert_eq!(dims.to_string(), "[?, 3, 224]");
    }

    #[test]
    fn test_resolved() {
        let dims = Dims::new(&[2, 3]).unwrap();
        assert_eq!(dims.rank(), Some(2));
        assert_eq!(dims.to_sizes(), Some(vec![2, 3]));
        assert_eq!(dims.volume(), Some(6));
    }

    #[test]
    fn test_scalar_and_capacity() {
        let scalar = Dims::new(&[]).unwrap();
        assert_eq!(scalar.volume(), Some(1));
        assert!(Dims::new(&[1; MAX_DIMS + 1]).is_none());
    }
}
