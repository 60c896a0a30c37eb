/// Alignment unit of every block size and payload offset, in bytes.
pub const ALIGNMENT: usize = 8;

/// Rounds the given size up to the heap alignment unit ([`ALIGNMENT`]).
///
/// # Examples
///
/// ```rust
/// use tagalloc::align;
///
/// assert_eq!(align!(13), 16);
/// assert_eq!(align!(16), 16);
/// assert_eq!(align!(0), 0);
/// ```
#[macro_export]
macro_rules! align {
  ($value:expr) => {
    $crate::align_to!($value, $crate::align::ALIGNMENT)
  };
}

/// Rounds the given size up to a multiple of `$align`, which must be a power of two.
///
/// ```rust
/// use tagalloc::align_to;
///
/// assert_eq!(align_to!(4097, 4096), 8192);
/// assert_eq!(align_to!(3, 4), 4);
/// ```
#[macro_export]
macro_rules! align_to {
  ($value:expr, $align:expr) => {
    ($value + $align - 1) & !($align - 1)
  };
}

/// Same as [`align!`] but returns `None` instead of wrapping on overflow.
pub fn checked_align(value: usize) -> Option<usize> {
  value
    .checked_add(ALIGNMENT - 1)
    .map(|v| v & !(ALIGNMENT - 1))
}
