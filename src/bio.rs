//! Buffer cache: an in-memory pool of disk-block contents.
//!
//! The pool is a fixed arena of slots partitioned into buckets by
//! `blockno % NBUCKET`, each bucket owning an MRU-first list under its own
//! lock, so lookups for unrelated blocks never contend. List links are slot
//! indices rather than pointers; a slot's control data is guarded by the
//! lock of the bucket currently holding it.
//!
//! Payload access goes through a per-slot sleep lock, held across device
//! I/O. Bucket locks are never held across I/O, and a miss never holds two
//! bucket locks at once: recycling is serialized by a dedicated lock and
//! touches one bucket at a time.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use array_macro::array;
use log::trace;

use crate::consts::{BSIZE, NBUCKET, NBUF};
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// Index link terminator.
const NIL: usize = usize::MAX;

/// One block's worth of bytes between the cache and a device. `write`
/// selects the direction: false reads the block into `data`, true writes
/// `data` out. The call returns only when the transfer is complete.
pub trait BlockDevice: Send + Sync {
    fn transfer(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE], write: bool);
}

/// Cached payload plus whether it currently reflects the device.
pub struct BufData {
    valid: bool,
    bytes: [u8; BSIZE],
}

impl BufData {
    const fn new() -> Self {
        Self {
            valid: false,
            bytes: [0; BSIZE],
        }
    }
}

/// Identity and list links of one slot. Guarded by the lock of the bucket
/// the slot is currently linked into (or, while unlinked mid-recycle, by
/// the recycle lock).
struct BufCtrl {
    dev: u32,
    blockno: u32,
    refcnt: usize,
    prev: usize,
    next: usize,
}

/// List ends of one bucket: `head` is most recently used, `tail` least.
struct Bucket {
    head: usize,
    tail: usize,
}

pub struct Bcache {
    device: Arc<dyn BlockDevice>,
    buckets: [SpinLock<Bucket>; NBUCKET],
    /// Serializes recycling so no path ever needs two bucket locks at once
    /// and a miss cannot race another miss into caching the same block
    /// twice.
    recycle_lock: SpinLock<()>,
    ctrl: [UnsafeCell<BufCtrl>; NBUF],
    data: [SleepLock<BufData>; NBUF],
}

// Each ctrl slot is only touched under its owning bucket's lock (or the
// recycle lock while unlinked); payloads are behind their sleep locks.
unsafe impl Sync for Bcache {}

impl Bcache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let cache = Self {
            device,
            buckets: array![_ => SpinLock::new(Bucket { head: NIL, tail: NIL }, "bcache.bucket"); NBUCKET],
            recycle_lock: SpinLock::new((), "bcache.recycle"),
            ctrl: array![i => UnsafeCell::new(BufCtrl {
                dev: 0,
                blockno: i as u32,
                refcnt: 0,
                prev: NIL,
                next: NIL,
            }); NBUF],
            data: array![_ => SleepLock::new(BufData::new()); NBUF],
        };
        // Seed every slot into the bucket its starting block number homes
        // to, so the membership invariant holds from the first call.
        for i in 0..NBUF {
            let mut bucket = cache.buckets[i % NBUCKET].lock();
            cache.push_mru(&mut bucket, i);
        }
        cache
    }

    /// Get an exclusive-locked buffer for (dev, blockno); its payload may
    /// be stale (not yet read from the device). On a miss, recycles the
    /// least recently used unreferenced slot, scanning buckets starting
    /// one past the home bucket and wrapping.
    ///
    /// Fatal when every slot in the pool is referenced; the pool is sized
    /// at build time and running it dry is a sizing error.
    pub fn bget(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let key = blockno as usize % NBUCKET;

        {
            let mut bucket = self.buckets[key].lock();
            if let Some(idx) = self.find(&bucket, dev, blockno) {
                unsafe { (*self.ctrl[idx].get()).refcnt += 1 };
                self.make_mru(&mut bucket, idx);
                drop(bucket);
                return self.wrap(idx, dev, blockno);
            }
        }

        // Miss. Take the recycle lock, then re-check the home bucket:
        // another thread may have cached the block between our two looks.
        let recycle = self.recycle_lock.lock();
        {
            let mut bucket = self.buckets[key].lock();
            if let Some(idx) = self.find(&bucket, dev, blockno) {
                unsafe { (*self.ctrl[idx].get()).refcnt += 1 };
                self.make_mru(&mut bucket, idx);
                drop(bucket);
                drop(recycle);
                return self.wrap(idx, dev, blockno);
            }
        }

        for i in 1..=NBUCKET {
            let donor_key = (key + i) % NBUCKET;
            let mut donor = self.buckets[donor_key].lock();
            // LRU end first.
            let mut idx = donor.tail;
            while idx != NIL {
                let (refcnt, toward_head) = unsafe {
                    let c = &*self.ctrl[idx].get();
                    (c.refcnt, c.prev)
                };
                if refcnt == 0 {
                    trace!(
                        "bcache: recycle slot {} for ({}, {})",
                        idx, dev, blockno
                    );
                    self.unlink(&mut donor, idx);
                    unsafe {
                        let c = &mut *self.ctrl[idx].get();
                        c.dev = dev;
                        c.blockno = blockno;
                        c.refcnt = 1;
                    }
                    drop(donor);
                    // Nobody holds this slot (refcnt was 0) and nobody can
                    // find it (unlinked), so the lock is free for the
                    // moment it takes to drop the stale payload.
                    self.data[idx].lock().valid = false;
                    let mut bucket = self.buckets[key].lock();
                    self.push_mru(&mut bucket, idx);
                    drop(bucket);
                    drop(recycle);
                    return self.wrap(idx, dev, blockno);
                }
                idx = toward_head;
            }
        }
        panic!("bget: no buffers");
    }

    /// Get a buffer whose payload is current: [`Bcache::bget`], plus a
    /// device read if the cached copy is stale.
    pub fn bread(&self, dev: u32, blockno: u32) -> Buf<'_> {
        let mut buf = self.bget(dev, blockno);
        if let Some(data) = buf.data.as_mut() {
            if !data.valid {
                self.device.transfer(dev, blockno, &mut data.bytes, false);
                data.valid = true;
            }
        }
        buf
    }

    /// Drop an upper layer's pin, taken earlier with [`Buf::pin`]. Fatal
    /// when the block is not cached or not pinned; a pinned block cannot
    /// have been recycled.
    pub fn unpin(&self, dev: u32, blockno: u32) {
        let key = blockno as usize % NBUCKET;
        let bucket = self.buckets[key].lock();
        let idx = match self.find(&bucket, dev, blockno) {
            Some(idx) => idx,
            None => panic!("bunpin: ({}, {}) not cached", dev, blockno),
        };
        unsafe {
            let c = &mut *self.ctrl[idx].get();
            if c.refcnt == 0 {
                panic!("bunpin: ({}, {}) not referenced", dev, blockno);
            }
            c.refcnt -= 1;
        }
    }

    fn wrap(&self, index: usize, dev: u32, blockno: u32) -> Buf<'_> {
        // May sleep waiting for the current holder; no spin lock is held.
        Buf {
            cache: self,
            index,
            dev,
            blockno,
            data: Some(self.data[index].lock()),
        }
    }

    /// Walk `bucket`'s list for (dev, blockno). Caller holds the bucket
    /// lock.
    fn find(&self, bucket: &Bucket, dev: u32, blockno: u32) -> Option<usize> {
        let mut idx = bucket.head;
        while idx != NIL {
            let c = unsafe { &*self.ctrl[idx].get() };
            if c.dev == dev && c.blockno == blockno {
                return Some(idx);
            }
            idx = c.next;
        }
        None
    }

    fn push_mru(&self, bucket: &mut Bucket, idx: usize) {
        let old_head = bucket.head;
        unsafe {
            let c = &mut *self.ctrl[idx].get();
            c.prev = NIL;
            c.next = old_head;
        }
        if old_head != NIL {
            unsafe { (*self.ctrl[old_head].get()).prev = idx };
        } else {
            bucket.tail = idx;
        }
        bucket.head = idx;
    }

    fn unlink(&self, bucket: &mut Bucket, idx: usize) {
        let (prev, next) = unsafe {
            let c = &*self.ctrl[idx].get();
            (c.prev, c.next)
        };
        if prev != NIL {
            unsafe { (*self.ctrl[prev].get()).next = next };
        } else {
            bucket.head = next;
        }
        if next != NIL {
            unsafe { (*self.ctrl[next].get()).prev = prev };
        } else {
            bucket.tail = prev;
        }
    }

    fn make_mru(&self, bucket: &mut Bucket, idx: usize) {
        self.unlink(bucket, idx);
        self.push_mru(bucket, idx);
    }

    /// Bucket contents head to tail as (dev, blockno, refcnt), for tests.
    #[cfg(test)]
    fn bucket_order(&self, key: usize) -> Vec<(u32, u32, usize)> {
        let bucket = self.buckets[key].lock();
        let mut out = Vec::new();
        let mut idx = bucket.head;
        while idx != NIL {
            let c = unsafe { &*self.ctrl[idx].get() };
            out.push((c.dev, c.blockno, c.refcnt));
            idx = c.next;
        }
        out
    }
}

/// An exclusive-locked cached block. Holding a `Buf` is holding the
/// block's lock; dropping it releases the lock, drops the reference, and
/// on the last reference moves the slot to its bucket's MRU position.
/// Derefs to the payload bytes.
pub struct Buf<'a> {
    cache: &'a Bcache,
    index: usize,
    dev: u32,
    blockno: u32,
    data: Option<SleepLockGuard<'a, BufData>>,
}

impl Buf<'_> {
    pub fn dev(&self) -> u32 {
        self.dev
    }

    pub fn blockno(&self) -> u32 {
        self.blockno
    }

    /// Synchronously write the payload out to the device.
    pub fn bwrite(&mut self) {
        if let Some(data) = self.data.as_mut() {
            self.cache
                .device
                .transfer(self.dev, self.blockno, &mut data.bytes, true);
        }
    }

    /// Take an extra reference so the block stays cache-resident after
    /// this `Buf` is dropped. Paired with [`Bcache::unpin`].
    pub fn pin(&self) {
        let key = self.blockno as usize % NBUCKET;
        let _bucket = self.cache.buckets[key].lock();
        unsafe { (*self.cache.ctrl[self.index].get()).refcnt += 1 };
    }
}

impl Deref for Buf<'_> {
    type Target = [u8; BSIZE];

    fn deref(&self) -> &Self::Target {
        &self.data.as_ref().unwrap().bytes
    }
}

impl DerefMut for Buf<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data.as_mut().unwrap().bytes
    }
}

impl Drop for Buf<'_> {
    fn drop(&mut self) {
        // Release the exclusive lock before touching the bucket.
        self.data.take();
        let key = self.blockno as usize % NBUCKET;
        let mut bucket = self.cache.buckets[key].lock();
        let refcnt = unsafe {
            let c = &mut *self.cache.ctrl[self.index].get();
            c.refcnt -= 1;
            c.refcnt
        };
        if refcnt == 0 {
            self.cache.make_mru(&mut bucket, self.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// In-memory block device. Unwritten blocks read as a per-block byte
    /// pattern so tests can tell blocks apart.
    struct RamDisk {
        blocks: SpinLock<HashMap<(u32, u32), Box<[u8; BSIZE]>>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
    }

    impl RamDisk {
        fn new() -> Self {
            Self {
                blocks: SpinLock::new(HashMap::new(), "ramdisk"),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }
        }

        fn pattern(dev: u32, blockno: u32) -> Box<[u8; BSIZE]> {
            let fill = (dev as usize * 31 + blockno as usize * 7 + 1) as u8;
            Box::new([fill; BSIZE])
        }
    }

    impl BlockDevice for RamDisk {
        fn transfer(&self, dev: u32, blockno: u32, data: &mut [u8; BSIZE], write: bool) {
            let mut blocks = self.blocks.lock();
            if write {
                self.writes.fetch_add(1, Ordering::SeqCst);
                blocks.insert((dev, blockno), Box::new(*data));
            } else {
                self.reads.fetch_add(1, Ordering::SeqCst);
                let src = blocks
                    .entry((dev, blockno))
                    .or_insert_with(|| Self::pattern(dev, blockno));
                *data = **src;
            }
        }
    }

    fn fresh() -> (Arc<RamDisk>, Bcache) {
        crate::cpu::set_hart(0);
        let disk = Arc::new(RamDisk::new());
        let cache = Bcache::new(disk.clone());
        (disk, cache)
    }

    #[test]
    fn read_hits_the_device_once() {
        let (disk, cache) = fresh();
        {
            let buf = cache.bread(1, 7);
            assert_eq!(buf[0], buf[BSIZE - 1]);
            assert_eq!(buf[0], (31 + 49 + 1) as u8);
        }
        assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
        {
            let _buf = cache.bread(1, 7);
        }
        // The second read is served from the cache.
        assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_goes_through_to_the_device() {
        let (disk, cache) = fresh();
        {
            let mut buf = cache.bread(0, 3);
            buf[0] = 0xAB;
            buf[BSIZE - 1] = 0xCD;
            buf.bwrite();
        }
        assert_eq!(disk.writes.load(Ordering::SeqCst), 1);
        let stored = disk.blocks.lock().get(&(0, 3)).map(|b| (b[0], b[BSIZE - 1]));
        assert_eq!(stored, Some((0xAB, 0xCD)));
    }

    #[test]
    fn live_buffers_never_share_an_identity() {
        let (_disk, cache) = fresh();
        let bufs: Vec<Buf<'_>> = (0..10).map(|b| cache.bget(0, b)).collect();
        let mut slots: Vec<usize> = bufs.iter().map(|b| b.index).collect();
        slots.sort();
        slots.dedup();
        assert_eq!(slots.len(), 10);
    }

    #[test]
    fn bucket_membership_matches_current_identity() {
        let (_disk, cache) = fresh();
        for b in 0..50u32 {
            let _buf = cache.bread(0, b);
        }
        for key in 0..NBUCKET {
            for (_, blockno, _) in cache.bucket_order(key) {
                assert_eq!(blockno as usize % NBUCKET, key);
            }
        }
    }

    #[test]
    fn release_moves_the_buffer_to_mru() {
        let (_disk, cache) = fresh();
        let (a, b) = (5u32, 5 + NBUCKET as u32);
        let key = 5 % NBUCKET;
        {
            let _a = cache.bread(0, a);
        }
        {
            let _b = cache.bread(0, b);
        }
        let order = cache.bucket_order(key);
        assert_eq!(order[0].1, b);
        assert_eq!(order[1].1, a);

        // Touching `a` again makes it most recent.
        {
            let _a = cache.bread(0, a);
        }
        let order = cache.bucket_order(key);
        assert_eq!(order[0].1, a);
    }

    #[test]
    fn evicted_blocks_are_reread_from_the_device() {
        let (disk, cache) = fresh();
        {
            let _first = cache.bread(0, 1000);
        }
        assert_eq!(disk.reads.load(Ordering::SeqCst), 1);

        // Cycle far more distinct blocks than the pool holds, each
        // released before the next, then come back to the first.
        for b in 0..(2 * NBUF as u32) {
            let _buf = cache.bread(0, b);
        }
        {
            let _first = cache.bread(0, 1000);
        }
        assert_eq!(
            disk.reads.load(Ordering::SeqCst),
            2 * NBUF + 2,
            "block 1000 should have been evicted and reread"
        );
    }

    #[test]
    fn pinned_blocks_survive_eviction_pressure() {
        let (disk, cache) = fresh();
        {
            let buf = cache.bread(0, 1000);
            buf.pin();
        }
        let after_first = disk.reads.load(Ordering::SeqCst);

        for b in 0..(2 * NBUF as u32) {
            let _buf = cache.bread(0, b);
        }
        {
            let _pinned = cache.bread(0, 1000);
        }
        // Still cached: no new device read for it.
        assert_eq!(disk.reads.load(Ordering::SeqCst), after_first + 2 * NBUF);

        // Unpinned, it becomes evictable; checking out the whole pool
        // forces its slot to be recycled.
        cache.unpin(0, 1000);
        {
            let _all: Vec<Buf<'_>> =
                (10_000..10_000 + NBUF as u32).map(|b| cache.bget(0, b)).collect();
        }
        {
            let _pinned = cache.bread(0, 1000);
        }
        assert_eq!(
            disk.reads.load(Ordering::SeqCst),
            after_first + 2 * NBUF + 1
        );
    }

    #[test]
    #[should_panic(expected = "bget: no buffers")]
    fn pool_exhaustion_is_fatal() {
        let (_disk, cache) = fresh();
        let mut held = Vec::new();
        for b in 0..=NBUF as u32 {
            held.push(cache.bget(0, b));
        }
    }

    #[test]
    #[should_panic(expected = "bunpin")]
    fn unpinning_an_uncached_block_is_fatal() {
        let (_disk, cache) = fresh();
        cache.unpin(9, 9999);
    }

    #[test]
    fn exclusive_lock_serializes_block_updates() {
        let (disk, cache) = fresh();
        {
            let mut buf = cache.bread(0, 42);
            buf[..8].copy_from_slice(&0u64.to_le_bytes());
        }
        thread::scope(|s| {
            for hart in 0..4 {
                let cache = &cache;
                s.spawn(move || {
                    crate::cpu::set_hart(hart);
                    for _ in 0..200 {
                        let mut buf = cache.bread(0, 42);
                        let n = u64::from_le_bytes(buf[..8].try_into().unwrap());
                        buf[..8].copy_from_slice(&(n + 1).to_le_bytes());
                    }
                });
            }
        });
        let buf = cache.bread(0, 42);
        assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 800);
        // Concurrent readers of one block cost a single device read.
        assert_eq!(disk.reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_misses_cache_a_block_only_once() {
        let (disk, cache) = fresh();
        thread::scope(|s| {
            for hart in 0..4 {
                let cache = &cache;
                s.spawn(move || {
                    crate::cpu::set_hart(hart);
                    for b in 0..20u32 {
                        let buf = cache.bread(2, b);
                        assert_eq!(buf[0], RamDisk::pattern(2, b)[0]);
                    }
                });
            }
        });
        // Every block was cached by exactly one of the racing threads.
        assert_eq!(disk.reads.load(Ordering::SeqCst), 20);
    }
}
