use log::trace;

use crate::block::Block;

/// Explicit, doubly-linked list of free blocks.
///
/// The links live inside the free blocks themselves (see [`crate::block`]);
/// this struct only remembers the head. Insertion is LIFO.
#[derive(Debug, Default)]
pub struct FreeList {
  head: Option<Block>,
  len: usize,
}

impl FreeList {
  pub const fn new() -> Self {
    Self { head: None, len: 0 }
  }

  pub const fn head(&self) -> Option<Block> {
    self.head
  }

  pub const fn len(&self) -> usize {
    self.len
  }

  /// Overwrites the recorded length without touching any links.
  #[cfg(test)]
  pub(crate) fn set_len(
    &mut self,
    len: usize,
  ) {
    self.len = len;
  }

  /// Inserts `block` at the head of the list.
  pub fn push_front(
    &mut self,
    mem: &mut [u8],
    block: Block,
  ) {
    trace!("free list push {:#x}", block.offset());

    block.set_prev_free(mem, None);
    block.set_next_free(mem, self.head);

    if let Some(old_head) = self.head {
      old_head.set_prev_free(mem, Some(block));
    }

    self.head = Some(block);
    self.len += 1;
  }

  /// Unlinks `block` from wherever it sits in the list.
  ///
  /// # Panics
  ///
  /// Panics if `block` is not a member: removing a block that is tagged
  /// allocated, or whose neighbours do not point back at it, means the heap
  /// is already corrupted.
  pub fn remove(
    &mut self,
    mem: &mut [u8],
    block: Block,
  ) {
    trace!("free list remove {:#x}", block.offset());

    assert!(
      !block.is_allocated(mem),
      "free list: block {:#x} is allocated",
      block.offset()
    );

    let next = block.next_free(mem);
    let prev = block.prev_free(mem);

    match prev {
      None => {
        assert_eq!(
          self.head,
          Some(block),
          "free list: block {:#x} has no predecessor but is not the head",
          block.offset()
        );
        self.head = next;
      }
      Some(prev) => {
        assert_eq!(
          prev.next_free(mem),
          Some(block),
          "free list: predecessor of {:#x} does not link to it",
          block.offset()
        );
        prev.set_next_free(mem, next);
      }
    }

    if let Some(next) = next {
      next.set_prev_free(mem, prev);
    }

    self.len -= 1;
  }

  /// Returns the first block, in list order, holding at least `min_size` bytes.
  pub fn find_first_fit(
    &self,
    mem: &[u8],
    min_size: usize,
  ) -> Option<Block> {
    self.iter(mem).find(|block| block.size(mem) >= min_size)
  }

  /// Walks the list from the head.
  ///
  /// The walk trusts the stored links; the consistency checker walks the
  /// list by hand so that it can bound a corrupted, cyclic list.
  pub fn iter<'a>(
    &self,
    mem: &'a [u8],
  ) -> Iter<'a> {
    Iter {
      mem,
      current: self.head,
    }
  }
}

pub struct Iter<'a> {
  mem: &'a [u8],
  current: Option<Block>,
}

impl Iterator for Iter<'_> {
  type Item = Block;

  fn next(&mut self) -> Option<Block> {
    let block = self.current?;
    self.current = block.next_free(self.mem);
    Some(block)
  }
}
