//! Physical page allocator.
//!
//! One free list per hart, each behind its own lock, so the hot
//! allocate/free path never contends across harts. A hart whose own list
//! runs dry steals from the others, taking one donor lock at a time.
//! Free pages store the list link in their own first bytes.

use std::ptr;

use array_macro::array;

use crate::consts::{ALLOC_JUNK, FREE_JUNK, NCPU, PGSIZE};
use crate::cpu;
use crate::spinlock::SpinLock;

pub struct Kmem {
    /// First managed address, page-aligned.
    base: usize,
    /// One past the last managed address, page-aligned.
    end: usize,
    freelist: [SpinLock<FreeList>; NCPU],
}

struct FreeList {
    head: *mut Run,
    len: usize,
}

/// A free page, linking to the next one through its own storage.
struct Run {
    next: *mut Run,
}

unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    /// # Safety
    /// `pa` must be an unused page, valid for writes.
    unsafe fn push(&mut self, pa: usize) {
        let run = pa as *mut Run;
        (*run).next = self.head;
        self.head = run;
        self.len += 1;
    }

    fn pop(&mut self) -> *mut u8 {
        if self.head.is_null() {
            return ptr::null_mut();
        }
        let run = self.head;
        self.head = unsafe { (*run).next };
        self.len -= 1;
        run as *mut u8
    }
}

impl Kmem {
    /// Take over the region `[start, end)`, rounding inward to page
    /// boundaries, and free every whole page onto the constructing hart's
    /// list. Stealing redistributes pages to other harts on demand.
    ///
    /// # Safety
    /// `[start, end)` must be valid, writable memory that nothing else
    /// touches for the lifetime of the allocator.
    pub unsafe fn new(start: usize, end: usize) -> Self {
        let kmem = Self {
            base: round_up_page(start),
            end: round_down_page(end),
            freelist: array![_ => SpinLock::new(FreeList::new(), "kmem"); NCPU],
        };
        let mut pa = kmem.base;
        while pa + PGSIZE <= kmem.end {
            kmem.free(pa as *mut u8);
            pa += PGSIZE;
        }
        kmem
    }

    /// Allocate one page. Tries the calling hart's list first, then steals
    /// a single page from the first other hart with one to spare. Returns
    /// null only when every list is empty. The page is filled with junk to
    /// flush out reads of uninitialized memory.
    pub fn alloc(&self) -> *mut u8 {
        let id = self.my_id();
        let mut pa = self.freelist[id].lock().pop();
        if pa.is_null() {
            for other in 0..NCPU {
                if other == id {
                    continue;
                }
                pa = self.freelist[other].lock().pop();
                if !pa.is_null() {
                    break;
                }
            }
        }
        if !pa.is_null() {
            unsafe { ptr::write_bytes(pa, ALLOC_JUNK, PGSIZE) };
        }
        pa
    }

    /// Return one page to the calling hart's list. The page lands on the
    /// freeing hart's list regardless of which hart allocated it; that
    /// keeps this path down to one uncontended lock.
    ///
    /// Panics on a pointer that is not a managed, page-aligned address.
    ///
    /// # Safety
    /// `pa` must have come from [`Kmem::alloc`] on this allocator and must
    /// not be used after this call.
    pub unsafe fn free(&self, pa: *mut u8) {
        let pa = pa as usize;
        if pa % PGSIZE != 0 || pa < self.base || pa + PGSIZE > self.end {
            panic!("kfree {:#x}", pa);
        }
        // Junk first; the list link then overwrites the first bytes.
        ptr::write_bytes(pa as *mut u8, FREE_JUNK, PGSIZE);
        let id = self.my_id();
        self.freelist[id].lock().push(pa);
    }

    /// Free-list length of every hart, for diagnostics.
    pub fn free_counts(&self) -> [usize; NCPU] {
        array![id => self.freelist[id].lock().len; NCPU]
    }

    /// Total free pages across all harts.
    pub fn free_pages(&self) -> usize {
        self.free_counts().iter().sum()
    }

    /// The hart id, read with preemption off for exactly that read.
    fn my_id(&self) -> usize {
        cpu::push_off();
        let id = cpu::cpu_id();
        cpu::pop_off();
        id
    }
}

#[inline]
fn round_up_page(addr: usize) -> usize {
    (addr + PGSIZE - 1) / PGSIZE * PGSIZE
}

#[inline]
fn round_down_page(addr: usize) -> usize {
    addr / PGSIZE * PGSIZE
}
