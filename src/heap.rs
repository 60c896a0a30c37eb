use std::{cmp::Ordering, fmt};

use log::{debug, error, trace, warn};

use crate::{
  align,
  align::{ALIGNMENT, checked_align},
  block::{self, Block, DSIZE, MIN_BLOCK_SIZE, OVERHEAD, WSIZE},
  check::{self, BlockInfo, Blocks, HeapReport, Violation},
  error::{AllocError, ProviderError},
  free_list::FreeList,
  provider::{MemoryProvider, VecProvider},
};

/// Default amount the heap grows by when no free block fits (4 KiB).
pub const CHUNK_SIZE: usize = 1 << 12;

/// Bytes requested from the provider by [`Heap::init`]: alignment padding,
/// prologue header and footer, one minimal free block, epilogue header.
pub const INITIAL_HEAP_SIZE: usize = 4 * WSIZE + MIN_BLOCK_SIZE;

/// Largest aligned chunk size; bigger requests are clamped to it.
const MAX_CHUNK_SIZE: usize = usize::MAX & !(ALIGNMENT - 1);

/// Opaque reference to an allocated payload: its offset in the heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(usize);

impl Handle {
  /// Builds a handle from a raw payload offset. Handles are only checked when
  /// they are passed back to the heap.
  pub const fn from_offset(offset: usize) -> Self {
    Self(offset)
  }

  pub const fn offset(self) -> usize {
    self.0
  }

  const fn block(self) -> Block {
    Block::at(self.0)
  }
}

impl From<Block> for Handle {
  fn from(block: Block) -> Self {
    Self(block.offset())
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Minimum number of bytes requested from the provider per extension.
  pub chunk_size: usize,
  /// Run the consistency checker after every mutating operation and log
  /// any violation.
  pub check_after_each_op: bool,
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self {
      chunk_size: CHUNK_SIZE,
      check_after_each_op: false,
    }
  }
}

impl HeapConfig {
  pub fn with_chunk_size(
    mut self,
    bytes: usize,
  ) -> Self {
    self.chunk_size = bytes;
    self
  }

  pub fn with_heap_checks(
    mut self,
    enabled: bool,
  ) -> Self {
    self.check_after_each_op = enabled;
    self
  }

  fn normalized(self) -> Self {
    Self {
      chunk_size: checked_align(self.chunk_size)
        .unwrap_or(MAX_CHUNK_SIZE)
        .max(MIN_BLOCK_SIZE),
      ..self
    }
  }
}

/// An explicit free-list heap over the memory of a [`MemoryProvider`].
///
/// ```text
///   ┌─────┬───────────┬──────────┬──────────┬─────┬──────────┬──────────┐
///   │ pad │ prologue  │ block    │ block    │ ... │ block    │ epilogue │
///   │     │ hdr | ftr │ (alloc)  │ (free)   │     │ (free)   │ hdr 0|1  │
///   └─────┴───────────┴──────────┴──────────┴─────┴──────────┴──────────┘
///                                     ▲                 ▲
///   free_list head ───────────────────┼─────────────────┘
///                                     └── next_free / prev_free links
/// ```
///
/// Placement is first fit over the free list, freed blocks are coalesced
/// immediately with their physical neighbours and pushed to the list head.
pub struct Heap<P: MemoryProvider = VecProvider> {
  provider: P,
  config: HeapConfig,
  prologue: Block,
  free_list: FreeList,
  extend_count: usize,
}

impl<P: MemoryProvider> Heap<P> {
  /// Builds a heap on `provider` with the default configuration.
  pub fn init(provider: P) -> Result<Self, AllocError> {
    Self::with_config(provider, HeapConfig::default())
  }

  pub fn with_config(
    mut provider: P,
    config: HeapConfig,
  ) -> Result<Self, AllocError> {
    let config = config.normalized();

    let current_break = provider.memory().len();
    let pad = align!(current_break) - current_break;

    let base = provider.extend(pad + INITIAL_HEAP_SIZE).map_err(|cause| {
      warn!("heap init failed: {cause}");
      AllocError::InitFail(cause)
    })?;

    let mem = provider.memory_mut();
    let start = base + pad;

    let prologue = Block::at(start + DSIZE);
    prologue.set_tags(mem, DSIZE, true);

    let first = prologue.next(mem);
    first.set_tags(mem, MIN_BLOCK_SIZE, false);
    first.next(mem).set_header(mem, 0, true);

    let mut free_list = FreeList::new();
    free_list.push_front(mem, first);

    debug!(
      "heap initialized at {start:#x}, first block {:#x}, chunk size {}",
      first.offset(),
      config.chunk_size
    );

    let heap = Self {
      provider,
      config,
      prologue,
      free_list,
      extend_count: 0,
    };
    heap.debug_check("init");

    Ok(heap)
  }

  /// Allocates a block with at least `size` usable bytes.
  ///
  /// A zero-byte request still receives a minimum-size block.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<Handle, AllocError> {
    let handle = self.allocate_block(size)?;
    self.debug_check("allocate");
    Ok(handle)
  }

  /// Frees the block behind `handle`. `None` is a no-op.
  pub fn free(
    &mut self,
    handle: Option<Handle>,
  ) -> Result<(), AllocError> {
    let Some(handle) = handle else {
      return Ok(());
    };

    let block = self.validate(handle)?;
    self.release(block);
    debug!("free {:#x}", handle.offset());

    self.debug_check("free");
    Ok(())
  }

  /// Resizes the block behind `handle` to hold at least `new_size` bytes.
  ///
  /// `None` behaves as [`allocate`](Self::allocate); a `new_size` of zero
  /// frees the block and returns `None`. The block is resized in place when
  /// shrinking or when the physically next block is free and large enough;
  /// otherwise the payload is copied to a fresh block. On failure the
  /// original block is left untouched.
  pub fn reallocate(
    &mut self,
    handle: Option<Handle>,
    new_size: usize,
  ) -> Result<Option<Handle>, AllocError> {
    let Some(handle) = handle else {
      return self.allocate(new_size).map(Some);
    };

    if new_size == 0 {
      self.free(Some(handle))?;
      return Ok(None);
    }

    let block = self.validate(handle)?;
    let needed = adjusted_size(new_size).ok_or(AllocError::OutOfMemory { requested: new_size })?;

    let mem = self.provider.memory_mut();
    let current = block.size(mem);

    let resized = match current.cmp(&needed) {
      Ordering::Equal => handle,
      Ordering::Greater => {
        // Slack below a minimum block stays inside the allocation.
        if current - needed >= MIN_BLOCK_SIZE {
          debug!("realloc {:#x}: shrink {current} -> {needed} in place", handle.offset());
          self.split(block, needed, current);
        }
        handle
      }
      Ordering::Less => {
        let next = block.next(mem);
        let combined = current + next.size(mem);

        if !next.is_allocated(mem) && combined >= needed {
          debug!("realloc {:#x}: grow {current} -> {needed} into next block", handle.offset());
          self.free_list.remove(mem, next);

          if combined - needed >= MIN_BLOCK_SIZE {
            self.split(block, needed, combined);
          } else {
            block.set_tags(mem, combined, true);
          }
          handle
        } else {
          self.relocate(block, new_size)?
        }
      }
    };

    self.debug_check("reallocate");
    Ok(Some(resized))
  }

  /// The caller-visible bytes of an allocated block.
  pub fn payload(
    &self,
    handle: Handle,
  ) -> Result<&[u8], AllocError> {
    let block = self.validate(handle)?;
    let mem = self.provider.memory();
    Ok(&mem[block.payload_range(mem)])
  }

  pub fn payload_mut(
    &mut self,
    handle: Handle,
  ) -> Result<&mut [u8], AllocError> {
    let block = self.validate(handle)?;
    let mem = self.provider.memory_mut();
    let range = block.payload_range(mem);
    Ok(&mut mem[range])
  }

  /// Number of payload bytes the block behind `handle` can hold.
  pub fn usable_size(
    &self,
    handle: Handle,
  ) -> Result<usize, AllocError> {
    let block = self.validate(handle)?;
    Ok(block.payload_size(self.provider.memory()))
  }

  /// Current size of the provider's region, in bytes.
  pub fn heap_size(&self) -> usize {
    self.provider.memory().len()
  }

  /// How many times the heap has grown since `init`.
  pub fn extend_count(&self) -> usize {
    self.extend_count
  }

  pub fn config(&self) -> &HeapConfig {
    &self.config
  }

  pub fn provider(&self) -> &P {
    &self.provider
  }

  /// Walks every block between the prologue and the epilogue, in address order.
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks::new(self.provider.memory(), self.first_block())
  }

  /// Walks the free list, in list order.
  pub fn free_blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
    let mem = self.provider.memory();
    self
      .free_list
      .iter(mem)
      .map(move |block| BlockInfo::read(mem, block))
  }

  /// Runs the consistency checker. Never mutates the heap.
  pub fn check(&self) -> Result<HeapReport, Violation> {
    check::check_heap(self)
  }

  pub(crate) fn memory(&self) -> &[u8] {
    self.provider.memory()
  }

  pub(crate) fn prologue(&self) -> Block {
    self.prologue
  }

  pub(crate) fn free_list(&self) -> &FreeList {
    &self.free_list
  }

  pub(crate) fn first_block(&self) -> Block {
    Block::at(self.prologue.offset() + DSIZE)
  }

  #[cfg(test)]
  pub(crate) fn memory_mut(&mut self) -> &mut [u8] {
    self.provider.memory_mut()
  }

  #[cfg(test)]
  pub(crate) fn free_list_mut(&mut self) -> &mut FreeList {
    &mut self.free_list
  }

  fn allocate_block(
    &mut self,
    size: usize,
  ) -> Result<Handle, AllocError> {
    let needed = adjusted_size(size).ok_or(AllocError::OutOfMemory { requested: size })?;

    let block = match self.free_list.find_first_fit(self.provider.memory(), needed) {
      Some(block) => block,
      None => {
        let extension = needed.max(self.config.chunk_size);
        self.extend_heap(extension).map_err(|cause| {
          warn!("allocate {size}: {cause}");
          AllocError::OutOfMemory { requested: size }
        })?
      }
    };

    self.place(block, needed);
    debug!("allocate {size} -> {:#x} ({needed} byte block)", block.offset());

    Ok(Handle::from(block))
  }

  /// Grows the heap by `bytes` and returns the resulting free block, already
  /// merged with a free block that ended the heap.
  fn extend_heap(
    &mut self,
    bytes: usize,
  ) -> Result<Block, ProviderError> {
    let old_break = self.provider.extend(bytes)?;
    self.extend_count += 1;

    let mem = self.provider.memory_mut();

    // The new block's header takes the place of the old epilogue.
    let block = Block::at(old_break);
    block.set_tags(mem, bytes, false);
    block.next(mem).set_header(mem, 0, true);

    debug!("heap extended by {bytes} bytes, break now {:#x}", mem.len());

    Ok(self.coalesce(block))
  }

  /// Marks `needed` bytes of the free `block` allocated, splitting off the
  /// remainder when it can form a block of its own.
  fn place(
    &mut self,
    block: Block,
    needed: usize,
  ) {
    let mem = self.provider.memory_mut();
    let size = block.size(mem);

    self.free_list.remove(mem, block);

    if size - needed >= MIN_BLOCK_SIZE {
      self.split(block, needed, size);
    } else {
      block.set_tags(mem, size, true);
    }
  }

  /// Shrinks the allocated `block` spanning `total` bytes to `needed` bytes
  /// and frees what follows.
  fn split(
    &mut self,
    block: Block,
    needed: usize,
    total: usize,
  ) {
    let mem = self.provider.memory_mut();

    block.set_tags(mem, needed, true);

    let rest = block.next(mem);
    rest.set_tags(mem, total - needed, false);
    trace!("split {:#x}: {needed} + {}", block.offset(), total - needed);

    self.coalesce(rest);
  }

  /// Moves the payload of `block` into a new block of `new_size` bytes.
  fn relocate(
    &mut self,
    block: Block,
    new_size: usize,
  ) -> Result<Handle, AllocError> {
    let target = self.allocate_block(new_size)?;

    let mem = self.provider.memory_mut();
    let count = block.payload_size(mem).min(target.block().payload_size(mem));
    mem.copy_within(block.offset()..block.offset() + count, target.offset());

    debug!("realloc {:#x}: moved {count} bytes to {:#x}", block.offset(), target.offset());

    self.release(block);
    Ok(target)
  }

  fn release(
    &mut self,
    block: Block,
  ) {
    let mem = self.provider.memory_mut();
    let size = block.size(mem);
    block.set_tags(mem, size, false);
    self.coalesce(block);
  }

  /// Merges the free `block` with free physical neighbours and pushes the
  /// result on the free list. Returns the merged block.
  fn coalesce(
    &mut self,
    block: Block,
  ) -> Block {
    let mem = self.provider.memory_mut();

    let prev = block.prev(mem);
    let next = block.next(mem);
    let prev_allocated = prev == block || prev.is_allocated(mem);
    let next_allocated = next.is_allocated(mem);

    let mut size = block.size(mem);

    let merged = match (prev_allocated, next_allocated) {
      (true, true) => block,
      (true, false) => {
        self.free_list.remove(mem, next);
        size += next.size(mem);
        block.set_tags(mem, size, false);
        block
      }
      (false, true) => {
        self.free_list.remove(mem, prev);
        size += prev.size(mem);
        prev.set_tags(mem, size, false);
        prev
      }
      (false, false) => {
        self.free_list.remove(mem, prev);
        self.free_list.remove(mem, next);
        size += prev.size(mem) + next.size(mem);
        prev.set_tags(mem, size, false);
        prev
      }
    };

    trace!(
      "coalesce {:#x} (prev {}, next {}) -> {:#x}, {size} bytes",
      block.offset(),
      if prev_allocated { "allocated" } else { "free" },
      if next_allocated { "allocated" } else { "free" },
      merged.offset()
    );

    self.free_list.push_front(mem, merged);
    merged
  }

  /// Resolves `handle` to an allocated block of this heap.
  ///
  /// Catches handles outside the heap, misaligned handles, handles whose
  /// boundary tags disagree and handles to blocks that are already free.
  fn validate(
    &self,
    handle: Handle,
  ) -> Result<Block, AllocError> {
    let mem = self.provider.memory();
    let block = handle.block();
    let offset = handle.offset();

    if offset < self.first_block().offset() || offset % ALIGNMENT != 0 || offset >= mem.len() {
      warn!("rejected handle {offset:#x}: outside heap or misaligned");
      return Err(AllocError::InvalidHandle(handle));
    }

    let header = block.header_word(mem);
    let size = block::unpack_size(header);

    // The block must end before the epilogue header.
    let fits = offset
      .checked_add(size)
      .is_some_and(|end| end <= mem.len());

    if size < MIN_BLOCK_SIZE || !fits || block.footer_word(mem) != header {
      warn!("rejected handle {offset:#x}: not a block boundary");
      return Err(AllocError::InvalidHandle(handle));
    }

    if !block::unpack_allocated(header) {
      warn!("rejected handle {offset:#x}: block is already free");
      return Err(AllocError::DoubleFree(handle));
    }

    Ok(block)
  }

  fn debug_check(
    &self,
    operation: &str,
  ) {
    if !self.config.check_after_each_op {
      return;
    }

    match self.check() {
      Ok(report) => trace!("heap check after {operation}: {report}"),
      Err(violation) => error!("heap check failed after {operation}: {violation}"),
    }
  }
}

impl<P: MemoryProvider> fmt::Display for Heap<P> {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    writeln!(f, "heap: {} bytes, {} free blocks", self.heap_size(), self.free_list.len())?;

    for info in self.blocks() {
      writeln!(
        f,
        "  {:#010x} {:>8} {}",
        info.offset,
        info.size,
        if info.allocated { "allocated" } else { "free" }
      )?;
    }

    Ok(())
  }
}

/// Block size needed to serve a `size`-byte request, or `None` on overflow.
fn adjusted_size(size: usize) -> Option<usize> {
  size
    .checked_add(OVERHEAD)
    .and_then(checked_align)
    .map(|bytes| bytes.max(MIN_BLOCK_SIZE))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn block_size_for(size: usize) -> usize {
    adjusted_size(size).unwrap()
  }

  fn new_heap() -> Heap {
    Heap::with_config(VecProvider::default(), HeapConfig::default().with_heap_checks(true)).unwrap()
  }

  fn fill(
    heap: &mut Heap,
    handle: Handle,
    seed: u8,
  ) {
    for (i, byte) in heap.payload_mut(handle).unwrap().iter_mut().enumerate() {
      *byte = seed.wrapping_add(i as u8);
    }
  }

  fn assert_filled(
    heap: &Heap,
    handle: Handle,
    seed: u8,
    len: usize,
  ) {
    let payload = heap.payload(handle).unwrap();
    for (i, byte) in payload[..len].iter().enumerate() {
      assert_eq!(*byte, seed.wrapping_add(i as u8), "byte {i} of {:#x}", handle.offset());
    }
  }

  #[test]
  fn test_init_layout() {
    let heap = new_heap();

    assert_eq!(heap.heap_size(), INITIAL_HEAP_SIZE);
    assert_eq!(heap.extend_count(), 0);

    let blocks: Vec<BlockInfo> = heap.blocks().collect();
    assert_eq!(
      blocks,
      vec![BlockInfo {
        offset: 4 * WSIZE,
        size: MIN_BLOCK_SIZE,
        allocated: false,
      }]
    );
    assert_eq!(heap.free_blocks().count(), 1);
    heap.check().unwrap();
  }

  #[test]
  fn test_init_fails_when_provider_refuses() {
    let result = Heap::init(VecProvider::new(INITIAL_HEAP_SIZE - 1));

    assert!(matches!(
      result,
      Err(AllocError::InitFail(ProviderError::Exhausted { .. }))
    ));
  }

  #[test]
  fn test_payload_alignment() {
    let mut heap = new_heap();

    for size in [0, 1, 7, 13, 64, 100, 333] {
      let handle = heap.allocate(size).unwrap();
      assert_eq!(handle.offset() % ALIGNMENT, 0);
      assert!(heap.usable_size(handle).unwrap() >= size);
    }

    heap.check().unwrap();
  }

  #[test]
  fn test_zero_size_gets_minimum_block() {
    let mut heap = new_heap();

    let handle = heap.allocate(0).unwrap();

    assert_eq!(heap.usable_size(handle).unwrap(), MIN_BLOCK_SIZE - OVERHEAD);
  }

  #[test]
  fn test_freed_block_not_merged_with_allocated_neighbour() {
    let mut heap = new_heap();

    let first = heap.allocate(16).unwrap();
    let second = heap.allocate(16).unwrap();
    assert_eq!(second.offset(), first.offset() + block_size_for(16));

    heap.free(Some(first)).unwrap();

    let free: Vec<BlockInfo> = heap.free_blocks().collect();
    assert!(free.contains(&BlockInfo {
      offset: first.offset(),
      size: block_size_for(16),
      allocated: false,
    }));
    assert!(heap.usable_size(second).is_ok());
    heap.check().unwrap();
  }

  #[test]
  fn test_first_fit_reuses_freed_region() {
    let mut heap = new_heap();

    let first = heap.allocate(100).unwrap();
    heap.free(Some(first)).unwrap();

    let second = heap.allocate(50).unwrap();

    assert_eq!(first, second);
  }

  #[test]
  fn test_coalesce_neighbours_in_either_order() {
    for reverse in [false, true] {
      let mut heap = new_heap();

      let a = heap.allocate(40).unwrap();
      let b = heap.allocate(72).unwrap();
      let _guard = heap.allocate(8).unwrap();

      let (x, y) = if reverse { (b, a) } else { (a, b) };
      heap.free(Some(x)).unwrap();
      heap.free(Some(y)).unwrap();

      let merged = heap
        .blocks()
        .find(|info| info.offset == a.offset())
        .unwrap();

      assert!(!merged.allocated);
      assert_eq!(merged.size, block_size_for(40) + block_size_for(72));
      heap.check().unwrap();
    }
  }

  #[test]
  fn test_coalesce_both_sides() {
    let mut heap = new_heap();

    let a = heap.allocate(24).unwrap();
    let b = heap.allocate(24).unwrap();
    let c = heap.allocate(24).unwrap();
    let _guard = heap.allocate(24).unwrap();

    heap.free(Some(a)).unwrap();
    heap.free(Some(c)).unwrap();
    let before = heap.free_blocks().count();

    heap.free(Some(b)).unwrap();

    assert_eq!(heap.free_blocks().count(), before - 1);
    let head = heap.free_blocks().next().unwrap();
    assert_eq!(head.offset, a.offset());
    assert_eq!(head.size, 3 * block_size_for(24));
    heap.check().unwrap();
  }

  #[test]
  fn test_first_fit_takes_list_head() {
    let mut heap = new_heap();

    let a = heap.allocate(64).unwrap();
    let _g1 = heap.allocate(8).unwrap();
    let b = heap.allocate(64).unwrap();
    let _g2 = heap.allocate(8).unwrap();

    heap.free(Some(a)).unwrap();
    heap.free(Some(b)).unwrap();

    // `b` was pushed last and sits at the head.
    assert_eq!(heap.allocate(64).unwrap(), b);
    assert_eq!(heap.allocate(64).unwrap(), a);
  }

  #[test]
  fn test_first_fit_is_deterministic() {
    let run = || {
      let mut heap = new_heap();
      let handles: Vec<Handle> = [48, 16, 200, 8, 96]
        .iter()
        .map(|&size| heap.allocate(size).unwrap())
        .collect();
      heap.free(Some(handles[0])).unwrap();
      heap.free(Some(handles[2])).unwrap();
      heap.allocate(40).unwrap()
    };

    assert_eq!(run(), run());
  }

  #[test]
  fn test_large_allocation_extends_and_merges_tail() {
    let mut heap = new_heap();

    let small = heap.allocate(100).unwrap();
    let big = heap.allocate(3 * CHUNK_SIZE).unwrap();

    assert!(heap.usable_size(big).unwrap() >= 3 * CHUNK_SIZE);
    assert!(big.offset() > small.offset());
    assert_eq!(heap.extend_count(), 2);

    let free: Vec<BlockInfo> = heap.free_blocks().collect();
    assert_eq!(free.len(), 1);
    heap.check().unwrap();
  }

  #[test]
  fn test_out_of_memory_keeps_prior_allocations() {
    let mut heap = Heap::init(VecProvider::new(16 * 1024)).unwrap();

    let kept = heap.allocate(100).unwrap();
    fill(&mut heap, kept, 7);

    assert_eq!(
      heap.allocate(1 << 20),
      Err(AllocError::OutOfMemory { requested: 1 << 20 })
    );
    assert_eq!(
      heap.allocate(usize::MAX),
      Err(AllocError::OutOfMemory { requested: usize::MAX })
    );

    assert_filled(&heap, kept, 7, 100);
    heap.check().unwrap();

    // Still usable afterwards.
    let again = heap.allocate(100).unwrap();
    assert_ne!(again, kept);
  }

  #[test]
  fn test_uniform_cycles_do_not_grow_heap() {
    let mut heap = new_heap();

    let handle = heap.allocate(64).unwrap();
    heap.free(Some(handle)).unwrap();
    let size = heap.heap_size();

    for _ in 0..1000 {
      let handle = heap.allocate(64).unwrap();
      heap.free(Some(handle)).unwrap();
    }

    assert_eq!(heap.heap_size(), size);
    assert_eq!(heap.extend_count(), 1);
  }

  #[test]
  fn test_free_none_is_noop() {
    let mut heap = new_heap();
    let size = heap.heap_size();

    heap.free(None).unwrap();

    assert_eq!(heap.heap_size(), size);
    heap.check().unwrap();
  }

  #[test]
  fn test_double_free_detected() {
    let mut heap = new_heap();

    let a = heap.allocate(32).unwrap();
    let _b = heap.allocate(32).unwrap();
    heap.free(Some(a)).unwrap();

    assert_eq!(heap.free(Some(a)), Err(AllocError::DoubleFree(a)));
    heap.check().unwrap();
  }

  #[test]
  fn test_invalid_handles_rejected() {
    let mut heap = new_heap();
    let a = heap.allocate(64).unwrap();
    heap.payload_mut(a).unwrap().fill(0);

    for bogus in [
      Handle::from_offset(0),
      Handle::from_offset(a.offset() + 3),
      Handle::from_offset(a.offset() + ALIGNMENT),
      Handle::from_offset(heap.heap_size() + 64),
    ] {
      assert_eq!(heap.free(Some(bogus)), Err(AllocError::InvalidHandle(bogus)));
    }

    heap.check().unwrap();
  }

  #[test]
  fn test_realloc_same_size_returns_same_handle() {
    let mut heap = new_heap();

    let handle = heap.allocate(40).unwrap();
    let usable = heap.usable_size(handle).unwrap();

    assert_eq!(heap.reallocate(Some(handle), usable), Ok(Some(handle)));
    assert_eq!(heap.usable_size(handle).unwrap(), usable);
  }

  #[test]
  fn test_realloc_null_and_zero() {
    let mut heap = new_heap();

    let handle = heap.reallocate(None, 24).unwrap().unwrap();
    assert!(heap.usable_size(handle).unwrap() >= 24);

    assert_eq!(heap.reallocate(Some(handle), 0), Ok(None));
    assert_eq!(heap.free(Some(handle)), Err(AllocError::DoubleFree(handle)));
  }

  #[test]
  fn test_realloc_shrink_splits_large_slack() {
    let mut heap = new_heap();

    let handle = heap.allocate(200).unwrap();
    let _guard = heap.allocate(8).unwrap();
    fill(&mut heap, handle, 3);

    assert_eq!(heap.reallocate(Some(handle), 16), Ok(Some(handle)));
    assert_eq!(heap.usable_size(handle).unwrap(), block_size_for(16) - OVERHEAD);
    assert_filled(&heap, handle, 3, 16);

    let rest = heap
      .blocks()
      .find(|info| info.offset == handle.offset() + block_size_for(16))
      .unwrap();
    assert!(!rest.allocated);
    assert_eq!(rest.size, block_size_for(200) - block_size_for(16));
    heap.check().unwrap();
  }

  #[test]
  fn test_realloc_shrink_keeps_small_slack() {
    let mut heap = new_heap();

    let handle = heap.allocate(40).unwrap();
    let before = heap.usable_size(handle).unwrap();

    assert_eq!(heap.reallocate(Some(handle), 32), Ok(Some(handle)));
    assert_eq!(heap.usable_size(handle).unwrap(), before);
    heap.check().unwrap();
  }

  #[test]
  fn test_realloc_grows_into_free_successor() {
    let mut heap = new_heap();

    let a = heap.allocate(32).unwrap();
    let b = heap.allocate(64).unwrap();
    let _guard = heap.allocate(16).unwrap();
    fill(&mut heap, a, 11);

    heap.free(Some(b)).unwrap();

    assert_eq!(heap.reallocate(Some(a), 64), Ok(Some(a)));
    assert!(heap.usable_size(a).unwrap() >= 64);
    assert_filled(&heap, a, 11, 32);
    heap.check().unwrap();
  }

  #[test]
  fn test_realloc_absorbs_whole_successor() {
    let mut heap = new_heap();

    let a = heap.allocate(32).unwrap();
    let b = heap.allocate(16).unwrap();
    let _guard = heap.allocate(16).unwrap();
    fill(&mut heap, a, 7);

    heap.free(Some(b)).unwrap();

    // Exactly the two blocks together: nothing is left over to split off.
    let combined = block_size_for(32) + block_size_for(16);
    assert_eq!(heap.reallocate(Some(a), combined - OVERHEAD), Ok(Some(a)));
    assert_eq!(heap.usable_size(a), Ok(combined - OVERHEAD));
    assert_filled(&heap, a, 7, 32);

    let free: Vec<BlockInfo> = heap.free_blocks().collect();
    assert_eq!(free.len(), 1);
    assert_ne!(free[0].offset, b.offset());
    heap.check().unwrap();
  }

  #[test]
  fn test_realloc_relocates_when_blocked() {
    let mut heap = new_heap();

    let a = heap.allocate(32).unwrap();
    let _b = heap.allocate(32).unwrap();
    fill(&mut heap, a, 42);

    let moved = heap.reallocate(Some(a), 256).unwrap().unwrap();

    assert_ne!(moved, a);
    assert!(heap.usable_size(moved).unwrap() >= 256);
    assert_filled(&heap, moved, 42, 32);
    assert_eq!(heap.usable_size(a), Err(AllocError::DoubleFree(a)));
    heap.check().unwrap();
  }

  #[test]
  fn test_realloc_out_of_memory_leaves_block() {
    let mut heap = Heap::init(VecProvider::new(16 * 1024)).unwrap();

    let a = heap.allocate(100).unwrap();
    let _b = heap.allocate(8).unwrap();
    fill(&mut heap, a, 5);

    assert_eq!(
      heap.reallocate(Some(a), 1 << 20),
      Err(AllocError::OutOfMemory { requested: 1 << 20 })
    );
    assert_filled(&heap, a, 5, 100);
    heap.check().unwrap();
  }

  #[test]
  fn test_custom_chunk_size() {
    let config = HeapConfig::default().with_chunk_size(1000);
    let mut heap = Heap::with_config(VecProvider::default(), config).unwrap();

    assert_eq!(heap.config().chunk_size, 1000);

    heap.allocate(64).unwrap();
    assert_eq!(heap.heap_size(), INITIAL_HEAP_SIZE + 1000);
  }

  #[test]
  fn test_oversized_chunk_size_is_clamped() {
    let config = HeapConfig::default().with_chunk_size(usize::MAX);
    let mut heap = Heap::with_config(VecProvider::default(), config).unwrap();

    assert_eq!(heap.config().chunk_size, MAX_CHUNK_SIZE);

    // Fits the block made by init; anything bigger needs an extension.
    heap.allocate(0).unwrap();
    assert_eq!(
      heap.allocate(100),
      Err(AllocError::OutOfMemory { requested: 100 })
    );
    heap.check().unwrap();
  }

  #[test]
  fn test_display_lists_blocks() {
    let mut heap = new_heap();
    heap.allocate(16).unwrap();

    let dump = heap.to_string();

    assert!(dump.starts_with("heap: "));
    assert!(dump.contains("allocated"));
  }

  #[cfg(unix)]
  #[test]
  fn test_mmap_backed_heap() {
    let provider = crate::MmapProvider::new(1 << 20).unwrap();
    let mut heap = Heap::init(provider).unwrap();

    let handle = heap.allocate(128).unwrap();
    let address = heap.provider().base_ptr() as usize + handle.offset();
    assert_eq!(address % ALIGNMENT, 0);

    heap.payload_mut(handle).unwrap().fill(0x5A);
    assert!(heap.payload(handle).unwrap().iter().all(|&b| b == 0x5A));

    heap.free(Some(handle)).unwrap();
    heap.check().unwrap();
  }
}
