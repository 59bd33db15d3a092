//! Buddy allocator for variable-size kernel allocations.
//!
//! The managed region is carved into power-of-two blocks down to
//! [`LEAF_SIZE`]. Each size class k keeps a free list of whole blocks of
//! `LEAF_SIZE << k` bytes, a bitmap of allocated blocks, and (for k > 0) a
//! bitmap of blocks split into two size-(k-1) halves. One bit per block per
//! property: simpler to verify than the folklore trick of sharing an XORed
//! bit between buddies, at twice the bitmap cost.
//!
//! All metadata lives at the front of the managed region itself, so the
//! allocator owns no memory beyond the range it is handed. A single lock
//! serializes everything; every operation is O(log(region / leaf)), which
//! is the known scalability ceiling of this design.

use std::fmt::Write as _;
use std::mem::size_of;
use std::ptr;

use bit_field::BitField;
use log::debug;

use crate::consts::LEAF_SIZE;
use crate::spinlock::SpinLock;

use super::list::List;

/// The allocator handle. All public entry points take the allocator-wide
/// lock; none of them blocks on anything but that lock.
pub struct BuddyAllocator(SpinLock<BuddySystem>);

impl BuddyAllocator {
    pub const fn new() -> Self {
        Self(SpinLock::new(BuddySystem::uninit(), "buddy"))
    }

    /// Hand the region `[start, end)` to the allocator. Boundaries are
    /// rounded inward to leaf-size multiples; metadata is carved from the
    /// front of the region.
    ///
    /// Panics if called twice, if the region cannot even hold its own
    /// metadata, or if the post-init accounting self-check fails.
    ///
    /// # Safety
    /// `[start, end)` must be valid, writable memory that nothing else
    /// touches for the lifetime of the allocator.
    pub unsafe fn init(&self, start: usize, end: usize) {
        self.0.lock().init(start, end);
    }

    /// Allocate `nbytes` of memory, rounded up to the nearest block size.
    /// A request of 0 bytes is treated as a request for one leaf. Returns
    /// null when no free block of sufficient size exists.
    pub fn alloc(&self, nbytes: usize) -> *mut u8 {
        self.0.lock().malloc(nbytes)
    }

    /// Free a block previously returned by [`BuddyAllocator::alloc`],
    /// merging it with its buddy as far up as possible.
    ///
    /// Panics if `raw` is outside the managed range, is not a block
    /// boundary, or refers to a block that is not currently allocated.
    ///
    /// # Safety
    /// `raw` must have come from `alloc` on this allocator and must not be
    /// used after this call.
    pub unsafe fn free(&self, raw: *mut u8) {
        self.0.lock().free(raw as usize);
    }

    /// Render every size class's free list and bitmaps as address ranges.
    /// Debugging aid only.
    pub fn dump(&self) -> String {
        let text = self.0.lock().dump();
        debug!("{}", text);
        text
    }

    /// Byte accounting for the managed region.
    pub fn stats(&self) -> BuddyStats {
        self.0.lock().stats()
    }
}

/// Snapshot of the allocator's bookkeeping, for diagnostics and tests.
/// At any instant `meta + unavailable + free + live allocations == heap`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuddyStats {
    /// Total managed bytes, rounded up to a power of two times the leaf.
    pub heap: usize,
    /// Bytes at the front of the region holding allocator metadata.
    pub meta: usize,
    /// Bytes past the usable end, present only because of the power-of-two
    /// rounding. Never handed out.
    pub unavailable: usize,
    /// Bytes currently on free lists.
    pub free: usize,
    /// Number of free blocks in each size class.
    pub free_blocks: Vec<usize>,
}

struct BuddySystem {
    /// First managed address, leaf-aligned.
    base: usize,
    /// One past the last usable address, leaf-aligned.
    actual_end: usize,
    /// Number of size classes; class k holds blocks of `LEAF_SIZE << k`.
    nsizes: usize,
    meta_bytes: usize,
    unavail_bytes: usize,
    initialized: bool,
    /// Per-class metadata, living inside the managed region.
    infos: *mut BdInfo,
}

// The raw metadata pointers are only dereferenced under the allocator lock.
unsafe impl Send for BuddySystem {}

/// Metadata for one size class. `alloc` and `split` are bitmaps with one
/// bit per block of this class, stored as raw byte arrays carved out of the
/// managed region (`split` is null for class 0, which is never split).
#[repr(C)]
struct BdInfo {
    free: List,
    alloc: *mut u8,
    split: *mut u8,
}

impl BuddySystem {
    const fn uninit() -> Self {
        Self {
            base: 0,
            actual_end: 0,
            nsizes: 0,
            meta_bytes: 0,
            unavail_bytes: 0,
            initialized: false,
            infos: ptr::null_mut(),
        }
    }

    unsafe fn init(&mut self, start: usize, end: usize) {
        if self.initialized {
            panic!("buddy system: init twice");
        }

        let mut cur = round_up(start, LEAF_SIZE);
        self.base = cur;
        self.actual_end = round_down(end, LEAF_SIZE);
        if self.actual_end <= self.base {
            panic!("buddy system: empty region");
        }

        // Number of size classes covering the region, rounding the managed
        // size up to the next power of two.
        let avail = self.actual_end - self.base;
        self.nsizes = log2(avail / LEAF_SIZE) + 1;
        if avail > blk_size(self.max_size()) {
            self.nsizes += 1;
        }
        debug!(
            "buddy: managing {:#x} bytes at {:#x}, {} size classes",
            avail, self.base, self.nsizes
        );

        // Carve the per-class metadata out of the front of the region.
        self.infos = carve::<BdInfo>(&mut cur, self.nsizes);
        for k in 0..self.nsizes {
            let nblk = self.n_blk(k);
            let info = &mut *self.infos.add(k);
            info.free.init();
            info.alloc = carve::<u8>(&mut cur, round_up(nblk, 8) / 8);
        }
        // Class 0 blocks are never split.
        for k in 1..self.nsizes {
            let nblk = self.n_blk(k);
            (*self.infos.add(k)).split = carve::<u8>(&mut cur, round_up(nblk, 8) / 8);
        }
        cur = round_up(cur, LEAF_SIZE);
        if cur > self.actual_end {
            panic!("buddy system: region too small for its own metadata");
        }

        // The metadata range and the rounding tail are permanently
        // allocated; everything in between becomes the initial free pool.
        let meta = self.mark_meta(cur);
        let unavail = self.mark_unavail();
        let free = self.init_free(cur);

        if free != blk_size(self.max_size()) - meta - unavail {
            panic!(
                "buddy system: init accounting: free {} meta {} unavail {}",
                free, meta, unavail
            );
        }
        self.meta_bytes = meta;
        self.unavail_bytes = unavail;
        self.initialized = true;
    }

    fn malloc(&mut self, nbytes: usize) -> *mut u8 {
        if !self.initialized {
            panic!("buddy system: use before init");
        }
        if nbytes > blk_size(self.max_size()) {
            return ptr::null_mut();
        }

        // Smallest class that fits, then the first class at or above it
        // with a free block.
        let fk = first_k(nbytes);
        let mut k = fk;
        while k < self.nsizes {
            if !unsafe { &*self.infos.add(k) }.free.is_empty() {
                break;
            }
            k += 1;
        }
        if k >= self.nsizes {
            return ptr::null_mut();
        }

        let addr = unsafe { (*self.infos.add(k)).free.pop() };
        self.set_alloc(k, self.blk_index(k, addr), true);

        // Split down to the requested class, keeping the lower half and
        // freeing the upper buddy one class below each time.
        while k > fk {
            self.set_split(k, self.blk_index(k, addr), true);
            k -= 1;
            self.set_alloc(k, self.blk_index(k, addr), true);
            unsafe { (*self.infos.add(k)).free.push(addr + blk_size(k)) };
        }

        addr as *mut u8
    }

    unsafe fn free(&mut self, raw: usize) {
        if !self.initialized {
            panic!("buddy system: use before init");
        }
        if raw < self.base || raw >= self.actual_end || (raw - self.base) % LEAF_SIZE != 0 {
            panic!("buddy system: free {:#x} out of range", raw);
        }

        let mut k = self.blk_k(raw);
        if (raw - self.base) % blk_size(k) != 0 {
            panic!("buddy system: free {:#x} not a block boundary", raw);
        }
        if !self.is_alloc(k, self.blk_index(k, raw)) {
            panic!("buddy system: free of free block {:#x}", raw);
        }

        // Walk upward, merging with the buddy at each class until the buddy
        // is still allocated (or split) or the top is reached, then push the
        // final block exactly once.
        let mut addr = raw;
        loop {
            let bi = self.blk_index(k, addr);
            self.set_alloc(k, bi, false);
            if k == self.max_size() {
                break;
            }
            let buddy = if bi % 2 == 0 { bi + 1 } else { bi - 1 };
            if self.is_alloc(k, buddy) {
                break;
            }
            let buddy_addr = self.blk_addr(k, buddy);
            (*(buddy_addr as *mut List)).remove();
            if buddy % 2 == 0 {
                addr = buddy_addr;
            }
            k += 1;
            self.set_split(k, self.blk_index(k, addr), false);
        }
        (*self.infos.add(k)).free.push(addr);
    }

    /// Recover the size class of an allocated block: the class whose parent
    /// is recorded as split while the block itself was handed out whole. A
    /// block with no split parent anywhere is the whole region.
    fn blk_k(&self, addr: usize) -> usize {
        for k in 0..self.max_size() {
            if self.is_split(k + 1, self.blk_index(k + 1, addr)) {
                return k;
            }
        }
        self.max_size()
    }

    /// Mark `[self.base, cur)`, the metadata, as permanently allocated.
    fn mark_meta(&mut self, cur: usize) -> usize {
        let meta = cur - self.base;
        debug!("buddy: {:#x} bytes of metadata", meta);
        self.mark(self.base, cur);
        meta
    }

    /// Mark the tail beyond the usable end, which exists only because the
    /// managed size is rounded up to a power of two, as permanently
    /// allocated.
    fn mark_unavail(&mut self) -> usize {
        let unavail = blk_size(self.max_size()) - (self.actual_end - self.base);
        debug!("buddy: {:#x} bytes unavailable", unavail);
        self.mark(self.actual_end, self.actual_end + unavail);
        unavail
    }

    /// Mark every block overlapping `[left, right)`, at every class, as
    /// allocated (and split, above class 0) so it is never handed out and
    /// never merged into.
    fn mark(&mut self, left: usize, right: usize) {
        assert_eq!(left % LEAF_SIZE, 0);
        assert_eq!(right % LEAF_SIZE, 0);

        for k in 0..self.nsizes {
            let mut bi = self.blk_index(k, left);
            let bj = self.blk_index_next(k, right);
            while bi < bj {
                self.set_alloc(k, bi, true);
                if k > 0 {
                    self.set_split(k, bi, true);
                }
                bi += 1;
            }
        }
    }

    /// Rebuild the free lists for the usable range `[left, actual_end)`.
    ///
    /// At each class below the maximum only the two blocks adjacent to the
    /// range boundaries can be free without being half of a larger free
    /// block, so inspecting those pairs covers the entire range. Returns
    /// the number of bytes placed on free lists.
    fn init_free(&mut self, left: usize) -> usize {
        let right = self.actual_end;
        let mut free = 0;
        for k in 0..self.max_size() {
            let lbi = self.blk_index_next(k, left);
            let rbi = self.blk_index(k, right);
            if lbi < self.n_blk(k) {
                free += self.init_free_pair(k, lbi);
            }
            // Skip the right boundary when it falls outside the bitmap
            // (usable range ends exactly at the heap top) or lands in the
            // pair just handled.
            if rbi <= lbi || rbi >= self.n_blk(k) || rbi / 2 == lbi / 2 {
                continue;
            }
            free += self.init_free_pair(k, rbi);
        }
        free
    }

    /// If exactly one block of the buddy pair containing `bi` is free, put
    /// that block on the class-k free list and return its size; a pair that
    /// is wholly free is represented higher up instead.
    fn init_free_pair(&mut self, k: usize, bi: usize) -> usize {
        let buddy = if bi % 2 == 0 { bi + 1 } else { bi - 1 };
        if self.is_alloc(k, bi) == self.is_alloc(k, buddy) {
            return 0;
        }
        let free_bi = if self.is_alloc(k, bi) { buddy } else { bi };
        let addr = self.blk_addr(k, free_bi);
        unsafe { (*self.infos.add(k)).free.push(addr) };
        blk_size(k)
    }

    fn dump(&self) -> String {
        let mut out = String::new();
        for k in 0..self.nsizes {
            let _ = writeln!(
                out,
                "size {} (blksz {} nblk {}):",
                k,
                blk_size(k),
                self.n_blk(k)
            );
            let _ = write!(out, "  free:");
            unsafe {
                (*self.infos.add(k)).free.for_each(|addr| {
                    let _ = write!(out, " [{:#x}, {:#x})", addr, addr + blk_size(k));
                });
            }
            let _ = writeln!(out);
            let alloc = self.render_bits(k, false);
            let _ = writeln!(out, "  alloc:{}", alloc);
            if k > 0 {
                let split = self.render_bits(k, true);
                let _ = writeln!(out, "  split:{}", split);
            }
        }
        out
    }

    /// Render the set bits of one class bitmap as address ranges.
    fn render_bits(&self, k: usize, split: bool) -> String {
        let mut out = String::new();
        let nblk = self.n_blk(k);
        let mut run_start = None;
        for bi in 0..=nblk {
            let set = bi < nblk
                && if split {
                    self.is_split(k, bi)
                } else {
                    self.is_alloc(k, bi)
                };
            match (set, run_start) {
                (true, None) => run_start = Some(bi),
                (false, Some(lo)) => {
                    let _ = write!(out, " [{:#x}, {:#x})", self.blk_addr(k, lo), self.blk_addr(k, bi));
                    run_start = None;
                }
                _ => {}
            }
        }
        out
    }

    fn stats(&self) -> BuddyStats {
        let mut free = 0;
        let mut free_blocks = Vec::with_capacity(self.nsizes);
        for k in 0..self.nsizes {
            let n = unsafe { (*self.infos.add(k)).free.len() };
            free += n * blk_size(k);
            free_blocks.push(n);
        }
        BuddyStats {
            heap: blk_size(self.max_size()),
            meta: self.meta_bytes,
            unavailable: self.unavail_bytes,
            free,
            free_blocks,
        }
    }

    /// Largest size class; also the last index into the metadata array.
    #[inline]
    fn max_size(&self) -> usize {
        self.nsizes - 1
    }

    /// Number of blocks of class k in the managed region.
    #[inline]
    fn n_blk(&self, k: usize) -> usize {
        1 << (self.max_size() - k)
    }

    fn blk_index(&self, k: usize, addr: usize) -> usize {
        (addr - self.base) / blk_size(k)
    }

    /// First class-k block wholly at or past `addr`.
    fn blk_index_next(&self, k: usize, addr: usize) -> usize {
        let mut bi = (addr - self.base) / blk_size(k);
        if (addr - self.base) % blk_size(k) != 0 {
            bi += 1;
        }
        bi
    }

    fn blk_addr(&self, k: usize, bi: usize) -> usize {
        self.base + bi * blk_size(k)
    }

    fn is_alloc(&self, k: usize, bi: usize) -> bool {
        unsafe { (*(*self.infos.add(k)).alloc.add(bi / 8)).get_bit(bi % 8) }
    }

    fn set_alloc(&mut self, k: usize, bi: usize, val: bool) {
        unsafe {
            (*(*self.infos.add(k)).alloc.add(bi / 8)).set_bit(bi % 8, val);
        }
    }

    fn is_split(&self, k: usize, bi: usize) -> bool {
        unsafe { (*(*self.infos.add(k)).split.add(bi / 8)).get_bit(bi % 8) }
    }

    fn set_split(&mut self, k: usize, bi: usize, val: bool) {
        unsafe {
            (*(*self.infos.add(k)).split.add(bi / 8)).set_bit(bi % 8, val);
        }
    }
}

/// Claim `len` elements of `T` from the front of the region tracked by
/// `cur`, zero them, and advance `cur` past them.
unsafe fn carve<T>(cur: &mut usize, len: usize) -> *mut T {
    let raw = *cur as *mut T;
    *cur += size_of::<T>() * len;
    ptr::write_bytes(raw, 0, len);
    raw
}

/// Smallest class whose block size is at least `nbytes`.
fn first_k(nbytes: usize) -> usize {
    let mut k = 0;
    let mut size = LEAF_SIZE;
    while size < nbytes {
        k += 1;
        size *= 2;
    }
    k
}

#[inline]
fn blk_size(k: usize) -> usize {
    (1 << k) * LEAF_SIZE
}

#[inline]
fn round_up(n: usize, sz: usize) -> usize {
    ((n + sz - 1) / sz) * sz
}

#[inline]
fn round_down(n: usize, sz: usize) -> usize {
    (n / sz) * sz
}

fn log2(mut n: usize) -> usize {
    let mut k = 0;
    while n > 1 {
        k += 1;
        n >>= 1;
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testmem::Arena;
    use std::thread;

    // 1024 leaf units of 16 bytes.
    const REGION: usize = 1024 * LEAF_SIZE;

    fn fresh() -> (Arena, BuddyAllocator) {
        let arena = Arena::new(REGION);
        let bd = BuddyAllocator::new();
        unsafe { bd.init(arena.base(), arena.end()) };
        (arena, bd)
    }

    #[test]
    fn init_accounting_holds() {
        let (_arena, bd) = fresh();
        let s = bd.stats();
        assert_eq!(s.heap, REGION);
        assert_eq!(s.unavailable, 0);
        assert_eq!(s.free, s.heap - s.meta);
    }

    #[test]
    fn init_handles_non_power_of_two_regions() {
        let arena = Arena::new(10_000);
        let bd = BuddyAllocator::new();
        unsafe { bd.init(arena.base(), arena.base() + 10_000) };
        let s = bd.stats();
        assert_eq!(s.heap, 16_384);
        assert_eq!(s.free, s.heap - s.meta - s.unavailable);
    }

    #[test]
    fn small_requests_round_to_leaves() {
        let (_arena, bd) = fresh();
        let before = bd.stats();
        let p = bd.alloc(0);
        assert!(!p.is_null());
        assert_eq!(bd.stats().free, before.free - LEAF_SIZE);
        unsafe { bd.free(p) };
        assert_eq!(bd.stats(), before);
    }

    #[test]
    fn oversized_requests_fail_cleanly() {
        let (_arena, bd) = fresh();
        assert!(bd.alloc(REGION + 1).is_null());
        // The whole heap can never be free: metadata occupies its front.
        assert!(bd.alloc(REGION).is_null());
    }

    #[test]
    fn hundred_byte_requests_use_the_128_class() {
        let (_arena, bd) = fresh();
        let before = bd.stats();

        let p1 = bd.alloc(100);
        let p2 = bd.alloc(100);
        let p3 = bd.alloc(100);
        assert!(!p1.is_null() && !p2.is_null() && !p3.is_null());
        assert_eq!(bd.stats().free, before.free - 3 * 128);

        // 128-byte blocks never overlap.
        let mut offs = [p1 as usize, p2 as usize, p3 as usize];
        offs.sort();
        assert!(offs[0] + 128 <= offs[1]);
        assert!(offs[1] + 128 <= offs[2]);

        // Freeing the first while the others live, then the rest, restores
        // the initial per-class free state exactly.
        unsafe { bd.free(p1) };
        assert_eq!(bd.stats().free, before.free - 2 * 128);
        unsafe { bd.free(p2) };
        unsafe { bd.free(p3) };
        assert_eq!(bd.stats(), before);
    }

    #[test]
    fn alloc_free_restores_state_for_every_class() {
        let (_arena, bd) = fresh();
        let mut nbytes = 1;
        while nbytes <= REGION / 2 {
            let before = bd.stats();
            let p = bd.alloc(nbytes);
            if !p.is_null() {
                unsafe { bd.free(p) };
                assert_eq!(bd.stats(), before, "class for {} bytes", nbytes);
            }
            nbytes *= 2;
        }
    }

    #[test]
    fn freed_siblings_merge_into_their_parent() {
        let (_arena, bd) = fresh();
        // A fresh split hands out the lower half and frees the upper; the
        // next allocation of the same class takes that upper half, so the
        // two are siblings.
        let a = bd.alloc(128) as usize;
        let b = bd.alloc(128) as usize;
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        assert_eq!(lo + 128, hi);

        let with_two_live = bd.stats();
        unsafe { bd.free(lo as *mut u8) };
        let with_one_free = bd.stats();
        assert_eq!(with_one_free.free_blocks[3], with_two_live.free_blocks[3] + 1);

        unsafe { bd.free(hi as *mut u8) };
        let merged = bd.stats();
        // Neither child remains in the 128 class; the pair reappears as one
        // block one class up (possibly merged even further).
        assert_eq!(merged.free_blocks[3], with_two_live.free_blocks[3]);
        assert_eq!(merged.free, with_two_live.free + 256);
    }

    #[test]
    fn conservation_under_mixed_workload() {
        let (_arena, bd) = fresh();
        let s0 = bd.stats();
        let mut live: Vec<(*mut u8, usize)> = Vec::new();
        let mut live_bytes = 0;

        // Deterministic but irregular request stream.
        let mut x: usize = 0x2545_f491;
        for step in 0..200 {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if step % 3 != 2 {
                let nbytes = x % 600;
                let p = bd.alloc(nbytes);
                if !p.is_null() {
                    let got = blk_size(first_k(nbytes));
                    live.push((p, got));
                    live_bytes += got;
                }
            } else if !live.is_empty() {
                let (p, got) = live.swap_remove(x % live.len());
                unsafe { bd.free(p) };
                live_bytes -= got;
            }
            let s = bd.stats();
            assert_eq!(s.free + live_bytes + s.meta + s.unavailable, s.heap);
        }
        for (p, _) in live {
            unsafe { bd.free(p) };
        }
        assert_eq!(bd.stats(), s0);
    }

    #[test]
    fn concurrent_alloc_free_conserves_the_heap() {
        let (_arena, bd) = fresh();
        let s0 = bd.stats();
        thread::scope(|s| {
            for hart in 0..4 {
                let bd = &bd;
                s.spawn(move || {
                    crate::cpu::set_hart(hart);
                    let mut held: Vec<*mut u8> = Vec::new();
                    for i in 0..300 {
                        let p = bd.alloc(32 + (i % 5) * 48);
                        if !p.is_null() {
                            held.push(p);
                        }
                        if i % 2 == 1 {
                            if let Some(p) = held.pop() {
                                unsafe { bd.free(p) };
                            }
                        }
                    }
                    for p in held {
                        unsafe { bd.free(p) };
                    }
                });
            }
        });
        assert_eq!(bd.stats(), s0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn freeing_a_foreign_pointer_is_fatal() {
        let (_arena, bd) = fresh();
        unsafe { bd.free(8 as *mut u8) };
    }

    #[test]
    #[should_panic(expected = "free of free block")]
    fn double_free_is_fatal() {
        let (_arena, bd) = fresh();
        let p = bd.alloc(100);
        unsafe {
            bd.free(p);
            bd.free(p);
        }
    }

    #[test]
    #[should_panic(expected = "init twice")]
    fn reinitialization_is_fatal() {
        let (arena, bd) = fresh();
        unsafe { bd.init(arena.base(), arena.end()) };
    }

    #[test]
    fn dump_mentions_every_class() {
        let (_arena, bd) = fresh();
        let p = bd.alloc(100);
        let text = bd.dump();
        for k in 0..bd.stats().free_blocks.len() {
            assert!(text.contains(&format!("size {} ", k)));
        }
        assert!(text.contains("alloc:"));
        assert!(text.contains("split:"));
        unsafe { bd.free(p) };
    }
}
