#![no_std]

//! tricache-alloc: a tcmalloc-style, three-tier thread-caching allocator for
//! small-to-medium objects (up to 256 KiB).
//!
//! - **Thread cache**: per-thread free lists, the lock-free fast path.
//! - **Central cache**: one bucket lock per size class, brokers between
//!   thread caches and the page cache.
//! - **Page cache**: a single coarse-locked allocator of whole pages, backed
//!   by the OS.
//!
//! Objects larger than [`config::MAX_BYTES`] skip the thread and central
//! caches entirely and are served straight from the page cache (or, past
//! [`config::MAX_PAGES`] pages, straight from the OS).
//!
//! # Usage
//!
//! ```ignore
//! #[global_allocator]
//! static GLOBAL: tricache_alloc::TriCache = tricache_alloc::TriCache;
//! ```

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

#[macro_use]
pub mod macros;

pub mod allocator;
pub mod central_cache;
pub mod config;
#[cfg(feature = "ffi")]
pub mod ffi;
mod once;
pub mod page_cache;
pub mod pagemap;
pub mod platform;
pub mod size_class;
pub mod span;
pub mod stats;
pub mod sync;
pub mod thread_cache;

pub use allocator::TriCache;
pub use config::{PAGE_SHIFT, PAGE_SIZE};

// `no_std` has no default panic handler. Only active for staticlib builds
// (the `fast` profile sets `panic = "abort"`); normal `std`/test builds use
// the standard library's handler.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
