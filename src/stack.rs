//! Fiber stack allocation: guard-paged mmap regions with a per-scheduler
//! free-list so that repeatedly spawning and finishing fibers does not repeatedly
//! mmap/munmap.
//!
//! Layout, low to high addresses: one `PROT_NONE` guard page, then the
//! usable stack region (which grows downward from its top, as all of this
//! crate's supported ISAs grow their native stacks). The guard page turns a
//! stack overflow into a segfault instead of silent heap corruption.

use std::collections::VecDeque;
use std::ptr;

use crate::error::{Error, Result};

/// Maximum number of unused stacks a scheduler keeps cached. We can't
/// deallocate the stack we're currently running on, so we always need at
/// least one cached stack around; the rest is just to amortize mmap cost.
pub const MAX_CACHED_STACKS: usize = 64;

fn page_size() -> usize {
    // SAFETY: sysconf with this argument never fails on a supported unix.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up_to_page(size: usize, page: usize) -> usize {
    (size + page - 1) & !(page - 1)
}

/// An mmap'd, guard-paged fiber stack.
pub struct Stack {
    /// Base address of the whole mapping, including the guard page.
    base: *mut u8,
    /// Length of the whole mapping, including the guard page.
    mapped_len: usize,
    /// Length of the usable (non-guard) region.
    usable_len: usize,
}

impl Stack {
    /// Allocate a fresh stack of at least `requested_size` usable bytes, plus
    /// one guard page below it.
    pub fn new(requested_size: usize) -> Result<Self> {
        let page = page_size();
        let usable_len = round_up_to_page(requested_size.max(page), page);
        let mapped_len = usable_len + page;

        // SAFETY: standard anonymous, private mapping; checked below.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mapped_len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::OutOfMemory);
        }
        let base = base as *mut u8;

        // SAFETY: `base + page .. base + mapped_len` is inside the mapping
        // we just created; the guard page below it is left PROT_NONE.
        let rc = unsafe {
            libc::mprotect(
                base.add(page) as *mut _,
                usable_len,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if rc != 0 {
            // SAFETY: undoing the mapping we just made.
            unsafe {
                libc::munmap(base as *mut _, mapped_len);
            }
            return Err(Error::OutOfMemory);
        }

        Ok(Stack {
            base,
            mapped_len,
            usable_len,
        })
    }

    /// Pointer to the top of the usable region (the initial stack pointer
    /// for a downward-growing stack), i.e. one-past-the-end of the mapping.
    pub fn top(&self) -> *mut u8 {
        // SAFETY: `base + mapped_len` is the one-past-the-end address of our
        // own mapping, a valid (non-dereferenced) pointer to compute.
        unsafe { self.base.add(self.mapped_len) }
    }

    /// Size of the usable (non-guard) region in bytes.
    pub fn usable_len(&self) -> usize {
        self.usable_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // SAFETY: `base`/`mapped_len` describe exactly the mapping created
        // in `new`, and this is the only place that unmaps it.
        unsafe {
            libc::munmap(self.base as *mut _, self.mapped_len);
        }
    }
}

// A `Stack` owns a raw mapping used exclusively by the fiber that runs on
// it; it never crosses scheduler threads. `!Send`/`!Sync` would be implied
// by the raw pointer fields already, this impl block intentionally left
// empty for discoverability of that fact.

/// Per-scheduler cache of unused stacks, all sized uniformly (the scheduler
/// picks a single stack size at construction, per §5 "Memory and stacks").
pub struct StackCache {
    stack_size: usize,
    free: VecDeque<Stack>,
    max_cached: usize,
}

impl StackCache {
    pub fn new(stack_size: usize) -> Self {
        StackCache {
            stack_size,
            free: VecDeque::new(),
            max_cached: MAX_CACHED_STACKS,
        }
    }

    /// Pop a cached stack if one exists, otherwise map a fresh one.
    pub fn acquire(&mut self) -> Result<Stack> {
        self.acquire_sized(self.stack_size)
    }

    /// Like [`Self::acquire`], but only serves from the cache when `size`
    /// matches this cache's configured stack size; a non-default size (e.g.
    /// a per-spawn override) always maps a fresh, uncached stack.
    pub fn acquire_sized(&mut self, size: usize) -> Result<Stack> {
        if size == self.stack_size {
            if let Some(stack) = self.free.pop_back() {
                log::trace!("reusing cached fiber stack");
                return Ok(stack);
            }
        }
        log::trace!("mapping new fiber stack of {} bytes", size);
        Stack::new(size)
    }

    /// Return a stack to the cache, unless the cache is already at capacity,
    /// in which case it's unmapped via `Drop`.
    ///
    /// The caller must never release the stack it is currently executing on
    /// (deallocating your own stack out from under yourself is undefined);
    /// fiber termination defers the release of its own stack to the next
    /// context switch, as described in §5.
    pub fn release(&mut self, stack: Stack) {
        if self.free.len() < self.max_cached {
            self.free.push_back(stack);
        } else {
            log::trace!("stack cache full, unmapping surplus stack");
            // dropped here, unmapping it
        }
    }

    /// Drop every cached stack. Called from scheduler teardown.
    pub fn purge(&mut self) {
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_is_page_aligned_and_usable() {
        let stack = Stack::new(64 * 1024).unwrap();
        let page = page_size();
        assert_eq!(stack.top() as usize % page, 0);
        assert!(stack.usable_len() >= 64 * 1024);
    }

    #[test]
    fn cache_reuses_released_stacks() {
        let mut cache = StackCache::new(64 * 1024);
        let s1 = cache.acquire().unwrap();
        let top1 = s1.top();
        cache.release(s1);
        let s2 = cache.acquire().unwrap();
        assert_eq!(s2.top(), top1);
    }

    #[test]
    fn cache_respects_max_cached() {
        let mut cache = StackCache::new(64 * 1024);
        cache.max_cached = 1;
        cache.release(Stack::new(64 * 1024).unwrap());
        cache.release(Stack::new(64 * 1024).unwrap());
        assert_eq!(cache.free.len(), 1);
    }
}
