use std::{error, fmt};

use crate::heap::Handle;

/// Failure reported by a [`MemoryProvider`](crate::MemoryProvider).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderError {
  /// The provider cannot grow by `requested` bytes; only `remaining` are left.
  Exhausted { requested: usize, remaining: usize },
  /// Reserving the backing region failed with the given `errno`.
  Map(i32),
}

impl fmt::Display for ProviderError {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::Exhausted { requested, remaining } => write!(
        f,
        "provider exhausted: requested {requested} bytes, {remaining} remaining"
      ),
      Self::Map(errno) => write!(f, "failed to map heap region (errno {errno})"),
    }
  }
}

impl error::Error for ProviderError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocError {
  /// The provider refused the initial region. The heap was never built.
  InitFail(ProviderError),
  /// The provider refused to grow the heap for a `requested`-byte allocation.
  OutOfMemory { requested: usize },
  /// The handle designates a block that is already free.
  DoubleFree(Handle),
  /// The handle does not designate a block boundary of this heap.
  InvalidHandle(Handle),
}

impl fmt::Display for AllocError {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match self {
      Self::InitFail(cause) => write!(f, "heap initialization failed: {cause}"),
      Self::OutOfMemory { requested } => {
        write!(f, "out of memory while allocating {requested} bytes")
      }
      Self::DoubleFree(handle) => write!(f, "double free of block {:#x}", handle.offset()),
      Self::InvalidHandle(handle) => write!(f, "invalid handle {:#x}", handle.offset()),
    }
  }
}

impl error::Error for AllocError {
  fn source(&self) -> Option<&(dyn error::Error + 'static)> {
    match self {
      Self::InitFail(cause) => Some(cause),
      _ => None,
    }
  }
}
