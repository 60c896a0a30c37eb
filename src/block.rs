//! Block layout codec.
//!
//! Every block is framed by two identical tag words:
//!
//! ```text
//!   ┌────────┬──────────────────────────────────┬────────┐
//!   │ header │             payload              │ footer │
//!   │ size|a │                                  │ size|a │
//!   └────────┴──────────────────────────────────┴────────┘
//!            ▲
//!            └── Block offset (what callers hold as a handle)
//!
//!   Free block payload:
//!   ┌────────┬───────────┬───────────┬─────────┬────────┐
//!   │ header │ next_free │ prev_free │ (stale) │ footer │
//!   └────────┴───────────┴───────────┴─────────┴────────┘
//! ```
//!
//! All offsets are byte offsets into the provider's memory. Words are
//! native-endian `usize`s.

use std::{mem, ops::Range};

use crate::align::ALIGNMENT;

/// Size of one tag/link word.
pub const WSIZE: usize = mem::size_of::<usize>();
/// Header plus footer.
pub const DSIZE: usize = 2 * WSIZE;
/// Bytes of metadata carried by every block.
pub const OVERHEAD: usize = DSIZE;
/// Header, two free-list links and footer.
pub const MIN_BLOCK_SIZE: usize = 4 * WSIZE;

const ALLOCATED_BIT: usize = 0x1;
const SIZE_MASK: usize = !(ALIGNMENT - 1);

/// Link value meaning "no block". Offset 0 is padding and never a payload.
const NIL: usize = 0;

#[inline]
pub const fn pack(
  size: usize,
  allocated: bool,
) -> usize {
  size | (allocated as usize)
}

#[inline]
pub const fn unpack_size(word: usize) -> usize {
  word & SIZE_MASK
}

#[inline]
pub const fn unpack_allocated(word: usize) -> bool {
  word & ALLOCATED_BIT != 0
}

/// Reads the word stored at `at`.
#[inline]
pub fn read_word(
  mem: &[u8],
  at: usize,
) -> usize {
  let mut buf = [0u8; WSIZE];
  buf.copy_from_slice(&mem[at..at + WSIZE]);
  usize::from_ne_bytes(buf)
}

/// Writes `value` as a word at `at`.
#[inline]
pub fn write_word(
  mem: &mut [u8],
  at: usize,
  value: usize,
) {
  mem[at..at + WSIZE].copy_from_slice(&value.to_ne_bytes());
}

/// A block, identified by the offset of its payload.
///
/// `Block` carries no data of its own; every accessor decodes the tags from
/// the memory slice it is given.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(usize);

impl Block {
  #[inline]
  pub const fn at(payload: usize) -> Self {
    Self(payload)
  }

  #[inline]
  pub const fn offset(self) -> usize {
    self.0
  }

  #[inline]
  pub const fn header(self) -> usize {
    self.0 - WSIZE
  }

  #[inline]
  pub fn footer(
    self,
    mem: &[u8],
  ) -> usize {
    self.0 + self.size(mem) - DSIZE
  }

  #[inline]
  pub fn size(
    self,
    mem: &[u8],
  ) -> usize {
    unpack_size(read_word(mem, self.header()))
  }

  #[inline]
  pub fn is_allocated(
    self,
    mem: &[u8],
  ) -> bool {
    unpack_allocated(read_word(mem, self.header()))
  }

  /// Raw header word.
  #[inline]
  pub fn header_word(
    self,
    mem: &[u8],
  ) -> usize {
    read_word(mem, self.header())
  }

  /// Raw footer word, located using the header's size.
  #[inline]
  pub fn footer_word(
    self,
    mem: &[u8],
  ) -> usize {
    read_word(mem, self.footer(mem))
  }

  /// Bytes available to the caller.
  #[inline]
  pub fn payload_size(
    self,
    mem: &[u8],
  ) -> usize {
    self.size(mem) - OVERHEAD
  }

  pub fn payload_range(
    self,
    mem: &[u8],
  ) -> Range<usize> {
    self.0..self.0 + self.payload_size(mem)
  }

  /// Writes identical header and footer tags.
  #[inline]
  pub fn set_tags(
    self,
    mem: &mut [u8],
    size: usize,
    allocated: bool,
  ) {
    let word = pack(size, allocated);
    write_word(mem, self.header(), word);
    write_word(mem, self.0 + size - DSIZE, word);
  }

  /// Writes only the header. Used for the epilogue, which has no footer.
  #[inline]
  pub fn set_header(
    self,
    mem: &mut [u8],
    size: usize,
    allocated: bool,
  ) {
    write_word(mem, self.header(), pack(size, allocated));
  }

  /// Physically following block.
  #[inline]
  pub fn next(
    self,
    mem: &[u8],
  ) -> Block {
    Block(self.0 + self.size(mem))
  }

  /// Physically preceding block, found through its footer.
  #[inline]
  pub fn prev(
    self,
    mem: &[u8],
  ) -> Block {
    let prev_size = unpack_size(read_word(mem, self.0 - DSIZE));
    Block(self.0 - prev_size)
  }

  #[inline]
  pub fn next_free(
    self,
    mem: &[u8],
  ) -> Option<Block> {
    decode_link(read_word(mem, self.0))
  }

  #[inline]
  pub fn prev_free(
    self,
    mem: &[u8],
  ) -> Option<Block> {
    decode_link(read_word(mem, self.0 + WSIZE))
  }

  #[inline]
  pub fn set_next_free(
    self,
    mem: &mut [u8],
    next: Option<Block>,
  ) {
    write_word(mem, self.0, encode_link(next));
  }

  #[inline]
  pub fn set_prev_free(
    self,
    mem: &mut [u8],
    prev: Option<Block>,
  ) {
    write_word(mem, self.0 + WSIZE, encode_link(prev));
  }
}

#[inline]
fn encode_link(block: Option<Block>) -> usize {
  block.map_or(NIL, Block::offset)
}

#[inline]
fn decode_link(word: usize) -> Option<Block> {
  (word != NIL).then_some(Block(word))
}
