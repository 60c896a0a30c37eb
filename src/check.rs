//! Heap consistency checker.
//!
//! A read-only walk over the whole heap and the whole free list. It trusts
//! nothing it reads: sizes are bounds-checked before they are followed and
//! the free-list walk stops on the first revisited block, so a corrupted
//! heap yields a [`Violation`] instead of a hang or a panic.
//!
//! Checked, in order:
//!
//! 1. prologue tags
//! 2. every block: size, alignment, bounds, header == footer
//! 3. no two physically adjacent free blocks
//! 4. epilogue tag at the very end of the heap
//! 5. free list: bounds, no repeats, only free blocks, back links agree
//! 6. every free block in the heap is on the free list

use std::{collections::BTreeSet, fmt};

use crate::{
  align::ALIGNMENT,
  block::{self, Block, DSIZE, MIN_BLOCK_SIZE, WSIZE},
  heap::Heap,
  provider::MemoryProvider,
};

/// Decoded view of one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Payload offset.
  pub offset: usize,
  pub size: usize,
  pub allocated: bool,
}

impl BlockInfo {
  pub(crate) fn read(
    mem: &[u8],
    block: Block,
  ) -> Self {
    Self {
      offset: block.offset(),
      size: block.size(mem),
      allocated: block.is_allocated(mem),
    }
  }
}

/// Iterator over the blocks between prologue and epilogue.
///
/// Stops at the epilogue, or early if a header would lie outside the heap.
pub struct Blocks<'a> {
  mem: &'a [u8],
  current: Option<Block>,
}

impl<'a> Blocks<'a> {
  pub(crate) fn new(
    mem: &'a [u8],
    first: Block,
  ) -> Self {
    Self {
      mem,
      current: Some(first),
    }
  }
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let block = self.current.take()?;

    if block.offset() < WSIZE || block.offset() > self.mem.len() {
      return None;
    }

    let info = BlockInfo::read(self.mem, block);
    if info.size == 0 {
      return None;
    }

    self.current = block.offset().checked_add(info.size).map(Block::at);
    Some(info)
  }
}

/// Summary of a successful check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapReport {
  pub heap_size: usize,
  pub blocks: usize,
  pub free_blocks: usize,
  pub free_bytes: usize,
  pub allocated_bytes: usize,
  pub largest_free: usize,
}

impl fmt::Display for HeapReport {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(
      f,
      "{} bytes, {} blocks ({} free, {} bytes free, largest {}), {} bytes allocated",
      self.heap_size,
      self.blocks,
      self.free_blocks,
      self.free_bytes,
      self.largest_free,
      self.allocated_bytes
    )
  }
}

/// First inconsistency found by [`check_heap`]. Offsets are payload offsets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Violation {
  BadPrologue { offset: usize },
  BadEpilogue { offset: usize },
  TagMismatch { offset: usize, header: usize, footer: usize },
  BadSize { offset: usize, size: usize },
  OutOfBounds { offset: usize },
  Uncoalesced { first: usize, second: usize },
  AllocatedInFreeList { offset: usize },
  FreeBlockNotListed { offset: usize },
  StrayLink { offset: usize },
  ListedTwice { offset: usize },
  BrokenBackLink { offset: usize, expected: Option<usize>, found: Option<usize> },
  ListLength { counted: usize, recorded: usize },
}

impl fmt::Display for Violation {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    match *self {
      Self::BadPrologue { offset } => write!(f, "prologue at {offset:#x} is damaged"),
      Self::BadEpilogue { offset } => {
        write!(f, "heap does not end with an epilogue (walk stopped at {offset:#x})")
      }
      Self::TagMismatch {
        offset,
        header,
        footer,
      } => write!(
        f,
        "block {offset:#x}: header {header:#x} and footer {footer:#x} disagree"
      ),
      Self::BadSize { offset, size } => write!(
        f,
        "block {offset:#x}: size {size} is below {MIN_BLOCK_SIZE} or not a multiple of {ALIGNMENT}"
      ),
      Self::OutOfBounds { offset } => write!(f, "block {offset:#x} lies outside the heap"),
      Self::Uncoalesced { first, second } => {
        write!(f, "adjacent free blocks {first:#x} and {second:#x} escaped coalescing")
      }
      Self::AllocatedInFreeList { offset } => {
        write!(f, "block {offset:#x} is on the free list but marked allocated")
      }
      Self::FreeBlockNotListed { offset } => {
        write!(f, "free block {offset:#x} is missing from the free list")
      }
      Self::StrayLink { offset } => {
        write!(f, "free list links to {offset:#x}, which is not a block")
      }
      Self::ListedTwice { offset } => write!(f, "block {offset:#x} appears twice in the free list"),
      Self::BrokenBackLink {
        offset,
        expected,
        found,
      } => write!(
        f,
        "block {offset:#x}: prev_free is {found:x?}, expected {expected:x?}"
      ),
      Self::ListLength { counted, recorded } => write!(
        f,
        "free list holds {counted} blocks but {recorded} are recorded"
      ),
    }
  }
}

impl std::error::Error for Violation {}

/// Validates every heap invariant. Returns a summary, or the first violation.
pub fn check_heap<P: MemoryProvider>(heap: &Heap<P>) -> Result<HeapReport, Violation> {
  let mem = heap.memory();
  let low = heap.provider().heap_low();
  let end = heap.provider().heap_high() + 1;

  let prologue = heap.prologue();
  let word = block::pack(DSIZE, true);
  if prologue.header() < low
    || prologue.offset() + WSIZE > end
    || prologue.header_word(mem) != word
    || block::read_word(mem, prologue.offset()) != word
  {
    return Err(Violation::BadPrologue {
      offset: prologue.offset(),
    });
  }

  let mut report = HeapReport {
    heap_size: mem.len(),
    ..HeapReport::default()
  };
  let mut free_in_heap = BTreeSet::new();
  let mut prev_free: Option<usize> = None;
  let mut block = heap.first_block();

  loop {
    let offset = block.offset();

    // The header must be readable.
    if offset > end {
      return Err(Violation::BadEpilogue { offset });
    }

    let header = block.header_word(mem);
    let size = block::unpack_size(header);
    let allocated = block::unpack_allocated(header);

    if size == 0 {
      if !allocated || offset != end {
        return Err(Violation::BadEpilogue { offset });
      }
      break;
    }

    // Only the lowest bit is a tag; the other low bits belong to the size.
    let raw_size = header & !1;
    if raw_size < MIN_BLOCK_SIZE || raw_size % ALIGNMENT != 0 {
      return Err(Violation::BadSize {
        offset,
        size: raw_size,
      });
    }

    // Block bytes span [offset - WSIZE, offset - WSIZE + size).
    if size > end - offset {
      return Err(Violation::OutOfBounds { offset });
    }

    let footer = block.footer_word(mem);
    if footer != header {
      return Err(Violation::TagMismatch {
        offset,
        header,
        footer,
      });
    }

    report.blocks += 1;

    if allocated {
      report.allocated_bytes += size;
      prev_free = None;
    } else {
      if let Some(first) = prev_free {
        return Err(Violation::Uncoalesced {
          first,
          second: offset,
        });
      }
      report.free_blocks += 1;
      report.free_bytes += size;
      report.largest_free = report.largest_free.max(size);
      free_in_heap.insert(offset);
      prev_free = Some(offset);
    }

    block = Block::at(offset + size);
  }

  let mut listed = BTreeSet::new();
  let mut expected_prev: Option<Block> = None;
  let mut current = heap.free_list().head();

  while let Some(block) = current {
    let offset = block.offset();

    if offset < low + DSIZE || offset > end - DSIZE {
      return Err(Violation::OutOfBounds { offset });
    }
    if !listed.insert(offset) {
      return Err(Violation::ListedTwice { offset });
    }
    if block.is_allocated(mem) {
      return Err(Violation::AllocatedInFreeList { offset });
    }
    if !free_in_heap.contains(&offset) {
      return Err(Violation::StrayLink { offset });
    }

    let found = block.prev_free(mem);
    if found != expected_prev {
      return Err(Violation::BrokenBackLink {
        offset,
        expected: expected_prev.map(Block::offset),
        found: found.map(Block::offset),
      });
    }

    expected_prev = Some(block);
    current = block.next_free(mem);
  }

  if let Some(&offset) = free_in_heap.difference(&listed).next() {
    return Err(Violation::FreeBlockNotListed { offset });
  }

  let recorded = heap.free_list().len();
  if listed.len() != recorded {
    return Err(Violation::ListLength {
      counted: listed.len(),
      recorded,
    });
  }

  Ok(report)
}
