//! # tagalloc - An Explicit Free-List Heap Allocator
//!
//! This crate implements `malloc`/`free`/`realloc` over a single growable
//! region, using **boundary tags** for constant-time coalescing and an
//! **explicit free list** with **first-fit** placement.
//!
//! ## Overview
//!
//! ```text
//!   Heap Layout:
//!
//!   ┌─────┬──────────┬─────────┬─────────┬─────────┬─────────┬──────────┐
//!   │ pad │ prologue │  A1     │  free   │  A2     │  free   │ epilogue │
//!   │     │  (8|1)   │ (48|1)  │ (96|0)  │ (32|1)  │(4000|0) │  (0|1)   │
//!   └─────┴──────────┴─────────┴─────────┴─────────┴─────────┴──────────┘
//!                                   ▲                   ▲
//!                                   │                   │
//!   free list:  head ──────────────────────────────────►┘
//!                                   └◄── next_free ─────┘
//!
//!   (size|allocated) is stored in a header and a footer word of every
//!   block, so both neighbours of a block can be found in O(1).
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   tagalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Block layout codec: tag words, navigation, free links
//!   ├── free_list  - Intrusive doubly-linked free list
//!   ├── heap       - Heap: init, allocate, free, reallocate
//!   ├── check      - Read-only consistency checker
//!   ├── provider   - Raw memory providers (Vec-backed, mmap-backed)
//!   └── error      - AllocError, ProviderError
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use tagalloc::{Heap, VecProvider};
//!
//! let mut heap = Heap::init(VecProvider::default()).unwrap();
//!
//! let handle = heap.allocate(64).unwrap();
//! heap.payload_mut(handle).unwrap()[..5].copy_from_slice(b"hello");
//!
//! let handle = heap.reallocate(Some(handle), 256).unwrap().unwrap();
//! assert_eq!(&heap.payload(handle).unwrap()[..5], b"hello");
//!
//! heap.free(Some(handle)).unwrap();
//! assert!(heap.check().is_ok());
//! ```
//!
//! ## How It Works
//!
//! Every block carries its size and an allocated bit in a header word and a
//! matching footer word:
//!
//! ```text
//!   Allocated block:                    Free block:
//!   ┌────────┬──────────────┬────────┐  ┌────────┬──────┬──────┬───┬────────┐
//!   │ size|1 │   payload    │ size|1 │  │ size|0 │ next │ prev │   │ size|0 │
//!   └────────┴──────────────┴────────┘  └────────┴──────┴──────┴───┴────────┘
//!            ▲                                   ▲
//!            └── Handle returned to the user     └── links into the free list
//! ```
//!
//! - **allocate** rounds the request up (header + footer, 8-byte multiple,
//!   at least four words), takes the first free-list block that fits, and
//!   splits off the remainder when it is big enough to be a block.
//! - When nothing fits, the heap asks its [`MemoryProvider`] for at least
//!   [`CHUNK_SIZE`] more bytes, the same way `sbrk` moves the program break.
//! - **free** flips the tag and merges with free neighbours on both sides.
//! - **reallocate** shrinks in place, grows into a free successor when it
//!   can, and otherwise moves the payload.
//!
//! Memory is addressed by byte offsets into the provider's region, never
//! by raw pointers, so the allocator core contains no `unsafe`.
//!
//! ## Limitations
//!
//! - **Single-threaded only**: operations take `&mut self`; wrap the heap in a
//!   mutex to share it
//! - **Never shrinks**: freed memory stays in the heap for reuse
//! - **Fixed alignment**: payloads are aligned to 8 bytes
//! - **Linear first fit**: allocation cost grows with the free-list length

pub mod align;
pub mod block;
pub mod check;
mod error;
mod free_list;
mod heap;
pub mod provider;

pub use check::{BlockInfo, HeapReport, Violation};
pub use error::{AllocError, ProviderError};
pub use heap::{CHUNK_SIZE, Handle, Heap, HeapConfig, INITIAL_HEAP_SIZE};
#[cfg(unix)]
pub use provider::MmapProvider;
pub use provider::{MemoryProvider, VecProvider};
