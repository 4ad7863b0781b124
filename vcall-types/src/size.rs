use core::fmt;

/// The logical width of a lane array: either a broadcasting scalar (`1`)
/// or a concrete vector width (`N`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Size(u32);

impl Size {
    /// A size-1, broadcasting value.
    pub const SCALAR: Self = Self(1);

    /// Wrap a raw size. `0` is legal and denotes the degenerate empty case.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// The raw width.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// `true` for a size-1 value, which broadcasts against any other size.
    pub const fn is_scalar(self) -> bool {
        self.0 == 1
    }

    /// `true` for the degenerate zero-lane case.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Two sizes disagree and neither broadcasts against the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeError {
    /// The unified size so far.
    pub expected: Size,
    /// The size that failed to unify against it.
    pub found: Size,
}

impl fmt::Display for SizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size {} is incompatible with unified size {} (neither is 1)",
            self.found, self.expected
        )
    }
}

/// Unify a set of argument sizes: `size = max(sizes)`, and every
/// non-broadcast input must equal `size` or be `1`.
///
/// Takes a `Clone` iterator so it can make two passes (derive the maximum,
/// then validate every entry against it) without collecting into an
/// intermediate buffer — this helper runs on a handful of argument sizes
/// per call site, not hot-loop data.
pub fn unify_size<I>(sizes: I) -> Result<Size, SizeError>
where
    I: IntoIterator<Item = Size>,
    I::IntoIter: Clone,
{
    let iter = sizes.into_iter();
    let unified = iter.clone().max().unwrap_or(Size::new(0));

    for s in iter {
        if s != unified && !s.is_scalar() {
            return Err(SizeError {
                expected: unified,
                found: s,
            });
        }
    }

    Ok(unified)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unifies_scalars_and_vectors() {
        let sizes = [Size::new(1), Size::new(5), Size::new(1)];
        assert_eq!(unify_size(sizes), Ok(Size::new(5)));
    }

    #[test]
    fn all_scalar_unifies_to_scalar() {
        let sizes = [Size::new(1), Size::new(1)];
        assert_eq!(unify_size(sizes), Ok(Size::new(1)));
    }

    #[test]
    fn empty_input_unifies_to_zero() {
        assert_eq!(unify_size(core::iter::empty()), Ok(Size::new(0)));
    }

    #[test]
    fn conflicting_vector_sizes_error() {
        let sizes = [Size::new(4), Size::new(5)];
        let err = unify_size(sizes).unwrap_err();
        assert_eq!(err.expected, Size::new(5));
        assert_eq!(err.found, Size::new(4));
    }

    #[quickcheck_macros::quickcheck]
    fn unified_size_is_always_the_max_or_fails(sizes: Vec<u32>) -> bool {
        let input: Vec<Size> = sizes.iter().copied().map(Size::new).collect();
        match unify_size(input.iter().copied()) {
            Ok(unified) => unified.get() == sizes.iter().copied().max().unwrap_or(0),
            Err(_) => true,
        }
    }
}
