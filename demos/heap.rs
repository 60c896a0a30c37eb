use std::io::Read;

use log::{LevelFilter, Log, Metadata, Record};
use tagalloc::{Handle, Heap, HeapConfig, MmapProvider};

/// Prints every record at or above the configured level to stdout.
struct StdoutLogger;

impl Log for StdoutLogger {
  fn enabled(
    &self,
    _metadata: &Metadata,
  ) -> bool {
    true
  }

  fn log(
    &self,
    record: &Record,
  ) {
    println!("  [{:<5}] {}", record.level(), record.args());
  }

  fn flush(&self) {}
}

static LOGGER: StdoutLogger = StdoutLogger;

/// Waits until the user presses ENTER.
/// Useful when you want to inspect the process with `pmap` or `gdb` between
/// steps, or just read the heap map at your own pace.
fn block_until_enter_pressed() {
  println!("\n>>> Press ENTER to continue...");
  let _ = std::io::stdin().bytes().next();
}

/// Prints where a handle lives in the process address space.
fn print_alloc(
  heap: &Heap<MmapProvider>,
  label: &str,
  handle: Handle,
) {
  let address = heap.provider().base_ptr() as usize + handle.offset();
  println!(
    "[{}] offset = {:#x}, address = {:#x}, usable = {} bytes, program break = {:?}",
    label,
    handle.offset(),
    address,
    heap.usable_size(handle).unwrap_or(0),
    heap.provider().program_break(),
  );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
  log::set_logger(&LOGGER)?;
  log::set_max_level(LevelFilter::Debug);

  // A 1 MiB mmap reservation stands in for the process heap; the heap moves
  // its private break forward in 4 KiB chunks.
  let provider = MmapProvider::new(1 << 20)?;
  let mut heap = Heap::with_config(provider, HeapConfig::default().with_heap_checks(true))?;

  println!("\n[0] Fresh heap");
  print!("{heap}");
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 1) Two small allocations. The first one fits the minimal free block
  //    created by init (on 64-bit); the second forces the first extension.
  // --------------------------------------------------------------------
  let first = heap.allocate(16)?;
  print_alloc(&heap, "1a", first);
  let second = heap.allocate(16)?;
  print_alloc(&heap, "1b", second);

  heap.payload_mut(first)?.fill(0xAB);
  print!("{heap}");
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 2) Free the first block. Its neighbours are the prologue and an
  //    allocated block, so it sits alone on the free list.
  // --------------------------------------------------------------------
  heap.free(Some(first))?;
  println!("\n[2] Freed first block");
  print!("{heap}");
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 3) A request that fits the freed block reuses it (first fit).
  // --------------------------------------------------------------------
  let third = heap.allocate(8)?;
  print_alloc(&heap, "3", third);
  println!(
    "[3] third == first? {}",
    if third == first {
      "Yes, it reused the freed block"
    } else {
      "No, it allocated somewhere else"
    }
  );
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 4) Grow the second block. Its successor is the free tail of the heap,
  //    so the block grows in place without copying.
  // --------------------------------------------------------------------
  heap.payload_mut(second)?[..4].copy_from_slice(b"tags");
  let grown = heap.reallocate(Some(second), 512)?.ok_or("realloc returned no block")?;
  print_alloc(&heap, "4", grown);
  println!(
    "[4] moved? {}, payload starts with {:?}",
    grown != second,
    String::from_utf8_lossy(&heap.payload(grown)?[..4])
  );
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 5) A 64 KiB block does not fit anywhere: the heap extends by exactly
  //    that much and merges the new region with its free tail.
  // --------------------------------------------------------------------
  let big = heap.allocate(64 * 1024)?;
  print_alloc(&heap, "5", big);
  print!("{heap}");
  block_until_enter_pressed();

  // --------------------------------------------------------------------
  // 6) Free everything; the heap collapses back into one free block.
  // --------------------------------------------------------------------
  for handle in [third, grown, big] {
    heap.free(Some(handle))?;
  }
  println!("\n[6] {}", heap.check()?);
  print!("{heap}");

  println!("\n[7] End of example. Dropping the heap unmaps its region.");
  Ok(())
}
