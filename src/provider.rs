//! Raw memory providers.
//!
//! A provider owns one contiguous region that only ever grows at its end,
//! the way `sbrk` moves the program break. The heap addresses it through
//! byte offsets, so the region may move (as a `Vec` does when it
//! reallocates) without invalidating any handle.

use log::debug;

use crate::error::ProviderError;

/// Default upper bound for a provider's region: 20 MiB.
pub const DEFAULT_MAX_HEAP: usize = 20 * (1 << 20);

pub trait MemoryProvider {
  /// Grows the region by exactly `bytes` and returns the offset where the new
  /// bytes begin (the old break).
  fn extend(
    &mut self,
    bytes: usize,
  ) -> Result<usize, ProviderError>;

  /// Offset of the first valid byte.
  fn heap_low(&self) -> usize {
    0
  }

  /// Offset of the last valid byte.
  fn heap_high(&self) -> usize {
    self.memory().len().saturating_sub(1)
  }

  fn memory(&self) -> &[u8];

  fn memory_mut(&mut self) -> &mut [u8];
}

/// A provider backed by a `Vec<u8>` with a hard size limit.
#[derive(Debug)]
pub struct VecProvider {
  bytes: Vec<u8>,
  max_size: usize,
}

impl VecProvider {
  pub fn new(max_size: usize) -> Self {
    Self {
      bytes: Vec::new(),
      max_size,
    }
  }

  pub fn max_size(&self) -> usize {
    self.max_size
  }

  pub fn remaining(&self) -> usize {
    self.max_size - self.bytes.len()
  }
}

impl Default for VecProvider {
  fn default() -> Self {
    Self::new(DEFAULT_MAX_HEAP)
  }
}

impl MemoryProvider for VecProvider {
  fn extend(
    &mut self,
    bytes: usize,
  ) -> Result<usize, ProviderError> {
    let remaining = self.remaining();
    if bytes > remaining {
      debug!("vec provider refused {bytes} bytes ({remaining} remaining)");
      return Err(ProviderError::Exhausted {
        requested: bytes,
        remaining,
      });
    }

    let old_break = self.bytes.len();
    self.bytes.resize(old_break + bytes, 0);

    Ok(old_break)
  }

  fn memory(&self) -> &[u8] {
    &self.bytes
  }

  fn memory_mut(&mut self) -> &mut [u8] {
    &mut self.bytes
  }
}

#[cfg(unix)]
pub use mmap::MmapProvider;

#[cfg(unix)]
mod mmap {
  use std::{io, ptr::NonNull, slice};

  use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE, c_void};
  use log::debug;

  use super::{DEFAULT_MAX_HEAP, MemoryProvider};
  use crate::{align_to, error::ProviderError};

  /// A provider that reserves its whole region with `mmap(2)` up front and
  /// moves a private break inside it, like the CS:APP `memlib` model of `sbrk`.
  ///
  /// ```text
  ///   base                 program_break               base + capacity
  ///   ├──────── heap ────────┤───────── reserved ──────────┤
  /// ```
  ///
  /// The region never moves, so `base_ptr() + offset` is a stable address for
  /// the provider's lifetime.
  pub struct MmapProvider {
    base: NonNull<u8>,
    capacity: usize,
    brk: usize,
  }

  // Safety: the mapping is owned exclusively by this value and only touched
  // through `&self`/`&mut self`.
  unsafe impl Send for MmapProvider {}

  impl MmapProvider {
    /// Reserves `max_size` bytes, rounded up to whole pages.
    pub fn new(max_size: usize) -> Result<Self, ProviderError> {
      let capacity = align_to!(max_size.max(1), page_size());

      let addr = unsafe {
        libc::mmap(
          std::ptr::null_mut(),
          capacity,
          PROT_READ | PROT_WRITE,
          MAP_PRIVATE | MAP_ANONYMOUS,
          -1,
          0,
        )
      };

      if addr == MAP_FAILED {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(ProviderError::Map(errno));
      }

      let base = NonNull::new(addr as *mut u8).ok_or(ProviderError::Map(0))?;

      debug!("mapped {capacity} bytes at {:?}", base.as_ptr());

      Ok(Self {
        base,
        capacity,
        brk: 0,
      })
    }

    pub fn with_default_size() -> Result<Self, ProviderError> {
      Self::new(DEFAULT_MAX_HEAP)
    }

    pub fn base_ptr(&self) -> *mut u8 {
      self.base.as_ptr()
    }

    /// Address one past the last byte handed out.
    pub fn program_break(&self) -> *mut u8 {
      unsafe { self.base.as_ptr().add(self.brk) }
    }

    pub fn capacity(&self) -> usize {
      self.capacity
    }
  }

  impl MemoryProvider for MmapProvider {
    fn extend(
      &mut self,
      bytes: usize,
    ) -> Result<usize, ProviderError> {
      let remaining = self.capacity - self.brk;
      if bytes > remaining {
        debug!("mmap provider refused {bytes} bytes ({remaining} remaining)");
        return Err(ProviderError::Exhausted {
          requested: bytes,
          remaining,
        });
      }

      let old_break = self.brk;
      self.brk += bytes;

      Ok(old_break)
    }

    fn memory(&self) -> &[u8] {
      unsafe { slice::from_raw_parts(self.base.as_ptr(), self.brk) }
    }

    fn memory_mut(&mut self) -> &mut [u8] {
      unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.brk) }
    }
  }

  impl Drop for MmapProvider {
    fn drop(&mut self) {
      unsafe {
        libc::munmap(self.base.as_ptr() as *mut c_void, self.capacity);
      }
    }
  }

  fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
      size if size > 0 => size as usize,
      _ => 4096,
    }
  }
}
