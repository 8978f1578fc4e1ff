#![forbid(unsafe_code)]
//! Arena-backed 2Q page cache.
//!
//! Entries live in a slab of slots addressed by `u32` indices. Each slot is
//! linked into one of two intrusive LRU lists and into a hash bucket chain.
//! New pages enter the probation queue (FIFO, A1in). Pages evicted from
//! probation leave a ghost key behind (A1out); a page that is loaded again
//! while its ghost is remembered goes straight to the protected queue
//! (LRU, Am), where hits move it to the front.
//!
//! Pinned pages are never chosen as victims. When every resident page is
//! pinned the cache grows past its capacity instead of failing and shrinks
//! back on later insertions. Evicting a pinned page explicitly is a
//! [`FatalError::PinnedEviction`].

use std::collections::VecDeque;

use rustc_hash::FxHashSet;
use tracing::warn;

use crate::types::{FatalError, PageId, Result};

const NIL: u32 = u32::MAX;
const FIB_MULT: u64 = 0x9E37_79B9_7F4A_7C15;

/// Tuning for [`PageCache`].
#[derive(Clone, Copy, Debug)]
pub struct CacheOptions {
    /// Resident pages before eviction kicks in.
    pub capacity: usize,
    /// Share of `capacity` reserved for the probation queue, in percent.
    pub probation_percent: u8,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            probation_percent: 25,
        }
    }
}

/// Queue a resident page belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Queue {
    /// First-time residents, evicted in arrival order.
    Probation,
    /// Pages seen again after a probation eviction, evicted least recently used.
    Protected,
}

/// Cache counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize)]
pub struct CacheStats {
    /// Lookups served from memory.
    pub hits: u64,
    /// Lookups that had to read the page.
    pub misses: u64,
    /// Pages dropped to make room.
    pub evictions: u64,
    /// Dirty pages written back on eviction.
    pub dirty_writebacks: u64,
    /// Insertions that had to exceed capacity because every page was pinned.
    pub overcommits: u64,
}

struct Slot<T> {
    key: PageId,
    value: T,
    queue: Queue,
    prev: u32,
    next: u32,
    hash_next: u32,
    pin_count: u32,
    dirty: bool,
}

/// Head is the most recent entry, tail the next victim.
#[derive(Clone, Copy)]
struct List {
    head: u32,
    tail: u32,
    len: usize,
}

impl List {
    const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }
}

/// 2Q cache keyed by [`PageId`].
pub struct PageCache<T> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<u32>,
    buckets: Vec<u32>,
    bucket_shift: u32,
    probation: List,
    protected: List,
    ghosts: VecDeque<PageId>,
    ghost_set: FxHashSet<PageId>,
    ghost_capacity: usize,
    capacity: usize,
    probation_target: usize,
    stats: CacheStats,
}

impl<T> PageCache<T> {
    /// Empty cache sized by `options`.
    pub fn new(options: CacheOptions) -> Self {
        let capacity = options.capacity.max(2);
        let percent = options.probation_percent.clamp(1, 99) as usize;
        let probation_target = (capacity * percent / 100).max(1);
        let bucket_count = (capacity * 2).next_power_of_two();
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            buckets: vec![NIL; bucket_count],
            bucket_shift: 64 - bucket_count.trailing_zeros(),
            probation: List::new(),
            protected: List::new(),
            ghosts: VecDeque::new(),
            ghost_set: FxHashSet::default(),
            ghost_capacity: capacity,
            capacity,
            probation_target,
            stats: CacheStats::default(),
        }
    }

    /// Resident page limit.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Resident pages.
    pub fn len(&self) -> usize {
        self.probation.len + self.protected.len
    }

    /// True when nothing is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// True when `key` is resident.
    pub fn contains(&self, key: PageId) -> bool {
        self.find(key).is_some()
    }

    /// Which queue holds `key`, if resident.
    pub fn queue_of(&self, key: PageId) -> Option<Queue> {
        self.find(key).map(|idx| self.slot(idx).queue)
    }

    /// Returns true while `key` is remembered as recently evicted from probation.
    pub fn is_ghost(&self, key: PageId) -> bool {
        self.ghost_set.contains(&key)
    }

    /// Looks up `key` without touching recency or counters.
    pub fn peek(&self, key: PageId) -> Option<&T> {
        self.find(key).map(|idx| &self.slot(idx).value)
    }

    /// Mutable variant of [`PageCache::peek`].
    pub fn peek_mut(&mut self, key: PageId) -> Option<&mut T> {
        let idx = self.find(key)?;
        Some(&mut self.slot_mut(idx).value)
    }

    /// Looks up `key`, counting a hit or miss and refreshing recency.
    pub fn get(&mut self, key: PageId) -> Option<&T> {
        let idx = self.lookup_touch(key)?;
        Some(&self.slot(idx).value)
    }

    /// Mutable variant of [`PageCache::get`]. Does not mark the page dirty.
    pub fn get_mut(&mut self, key: PageId) -> Option<&mut T> {
        let idx = self.lookup_touch(key)?;
        Some(&mut self.slot_mut(idx).value)
    }

    /// Inserts or replaces `key`. Dirty victims are handed to `flush` before
    /// they leave the cache; a flush error aborts the insertion and leaves the
    /// victim resident.
    pub fn put<F>(&mut self, key: PageId, value: T, mut flush: F) -> Result<()>
    where
        F: FnMut(PageId, &T) -> Result<()>,
    {
        if let Some(idx) = self.find(key) {
            self.slot_mut(idx).value = value;
            self.touch(idx);
            return Ok(());
        }
        while self.len() >= self.capacity {
            match self.pick_victim() {
                Some(victim) => self.evict_slot(victim, &mut flush)?,
                None => {
                    self.stats.overcommits += 1;
                    warn!(
                        page = key.0,
                        resident = self.len(),
                        capacity = self.capacity,
                        "cache.overcommit"
                    );
                    break;
                }
            }
        }
        let queue = if self.ghost_set.remove(&key) {
            self.ghosts.retain(|ghost| *ghost != key);
            Queue::Protected
        } else {
            Queue::Probation
        };
        let slot = Slot {
            key,
            value,
            queue,
            prev: NIL,
            next: NIL,
            hash_next: NIL,
            pin_count: 0,
            dirty: false,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        };
        self.hash_insert(idx);
        self.push_front(idx);
        Ok(())
    }

    /// Increments the pin count. Returns false when `key` is not resident.
    pub fn pin(&mut self, key: PageId) -> bool {
        match self.find(key) {
            Some(idx) => {
                self.slot_mut(idx).pin_count += 1;
                true
            }
            None => false,
        }
    }

    /// Decrements the pin count.
    pub fn unpin(&mut self, key: PageId) {
        if let Some(idx) = self.find(key) {
            let slot = self.slot_mut(idx);
            if slot.pin_count == 0 {
                warn!(page = key.0, "cache.unpin_unpinned");
            }
            slot.pin_count = slot.pin_count.saturating_sub(1);
        }
    }

    /// True when `key` is resident and pinned.
    pub fn is_pinned(&self, key: PageId) -> bool {
        self.find(key)
            .map(|idx| self.slot(idx).pin_count > 0)
            .unwrap_or(false)
    }

    /// Sets or clears the dirty flag. Returns false when `key` is not resident.
    pub fn set_dirty(&mut self, key: PageId, dirty: bool) -> bool {
        match self.find(key) {
            Some(idx) => {
                self.slot_mut(idx).dirty = dirty;
                true
            }
            None => false,
        }
    }

    /// True when `key` is resident and dirty.
    pub fn is_dirty(&self, key: PageId) -> bool {
        self.find(key)
            .map(|idx| self.slot(idx).dirty)
            .unwrap_or(false)
    }

    /// Evicts `key`, writing it back through `flush` first when dirty.
    /// Returns false when the page was not resident.
    pub fn evict<F>(&mut self, key: PageId, mut flush: F) -> Result<bool>
    where
        F: FnMut(PageId, &T) -> Result<()>,
    {
        let Some(idx) = self.find(key) else {
            return Ok(false);
        };
        if self.slot(idx).pin_count > 0 {
            return Err(FatalError::PinnedEviction(key).into());
        }
        self.evict_slot(idx, &mut flush)?;
        Ok(true)
    }

    /// Drops `key` without write-back, regardless of pins or dirtiness.
    pub fn discard(&mut self, key: PageId) -> Option<T> {
        let idx = self.find(key)?;
        Some(self.remove_slot(idx).value)
    }

    /// Writes back every dirty page in page order and clears the flags.
    pub fn flush_dirty<F>(&mut self, mut flush: F) -> Result<usize>
    where
        F: FnMut(PageId, &T) -> Result<()>,
    {
        let mut dirty: Vec<(PageId, u32)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| match slot {
                Some(slot) if slot.dirty => Some((slot.key, idx as u32)),
                _ => None,
            })
            .collect();
        dirty.sort_unstable();
        for (key, idx) in &dirty {
            flush(*key, &self.slot(*idx).value)?;
            self.slot_mut(*idx).dirty = false;
            self.stats.dirty_writebacks += 1;
        }
        Ok(dirty.len())
    }

    /// Resident keys of `queue`, most recent first.
    pub fn keys(&self, queue: Queue) -> Vec<PageId> {
        let list = match queue {
            Queue::Probation => &self.probation,
            Queue::Protected => &self.protected,
        };
        let mut out = Vec::with_capacity(list.len);
        let mut cursor = list.head;
        while cursor != NIL {
            let slot = self.slot(cursor);
            out.push(slot.key);
            cursor = slot.next;
        }
        out
    }

    fn lookup_touch(&mut self, key: PageId) -> Option<u32> {
        match self.find(key) {
            Some(idx) => {
                self.stats.hits += 1;
                self.touch(idx);
                Some(idx)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    fn touch(&mut self, idx: u32) {
        if self.slot(idx).queue == Queue::Protected {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn pick_victim(&self) -> Option<u32> {
        let prefer_probation =
            self.probation.len > self.probation_target || self.protected.len == 0;
        let (first, second) = if prefer_probation {
            (&self.probation, &self.protected)
        } else {
            (&self.protected, &self.probation)
        };
        self.oldest_unpinned(first)
            .or_else(|| self.oldest_unpinned(second))
    }

    fn oldest_unpinned(&self, list: &List) -> Option<u32> {
        let mut cursor = list.tail;
        while cursor != NIL {
            let slot = self.slot(cursor);
            if slot.pin_count == 0 {
                return Some(cursor);
            }
            cursor = slot.prev;
        }
        None
    }

    fn evict_slot<F>(&mut self, idx: u32, flush: &mut F) -> Result<()>
    where
        F: FnMut(PageId, &T) -> Result<()>,
    {
        let slot = self.slot(idx);
        if slot.dirty {
            flush(slot.key, &slot.value)?;
            self.stats.dirty_writebacks += 1;
        }
        let removed = self.remove_slot(idx);
        self.stats.evictions += 1;
        if removed.queue == Queue::Probation {
            self.remember_ghost(removed.key);
        }
        Ok(())
    }

    fn remember_ghost(&mut self, key: PageId) {
        if self.ghost_set.insert(key) {
            self.ghosts.push_back(key);
        }
        while self.ghosts.len() > self.ghost_capacity {
            if let Some(old) = self.ghosts.pop_front() {
                self.ghost_set.remove(&old);
            }
        }
    }

    fn remove_slot(&mut self, idx: u32) -> Slot<T> {
        self.unlink(idx);
        self.hash_remove(idx);
        self.free.push(idx);
        match self.slots[idx as usize].take() {
            Some(slot) => slot,
            None => unreachable!("cache slot {idx} vanished while linked"),
        }
    }

    fn bucket_of(&self, key: PageId) -> usize {
        (key.0.wrapping_mul(FIB_MULT) >> self.bucket_shift) as usize
    }

    fn find(&self, key: PageId) -> Option<u32> {
        let mut cursor = self.buckets[self.bucket_of(key)];
        while cursor != NIL {
            let slot = self.slot(cursor);
            if slot.key == key {
                return Some(cursor);
            }
            cursor = slot.hash_next;
        }
        None
    }

    fn hash_insert(&mut self, idx: u32) {
        let bucket = self.bucket_of(self.slot(idx).key);
        let head = self.buckets[bucket];
        self.slot_mut(idx).hash_next = head;
        self.buckets[bucket] = idx;
    }

    fn hash_remove(&mut self, idx: u32) {
        let bucket = self.bucket_of(self.slot(idx).key);
        let next = self.slot(idx).hash_next;
        if self.buckets[bucket] == idx {
            self.buckets[bucket] = next;
            return;
        }
        let mut cursor = self.buckets[bucket];
        while cursor != NIL {
            let after = self.slot(cursor).hash_next;
            if after == idx {
                self.slot_mut(cursor).hash_next = next;
                return;
            }
            cursor = after;
        }
    }

    fn list_mut(&mut self, queue: Queue) -> &mut List {
        match queue {
            Queue::Probation => &mut self.probation,
            Queue::Protected => &mut self.protected,
        }
    }

    fn push_front(&mut self, idx: u32) {
        let queue = self.slot(idx).queue;
        let head = self.list_mut(queue).head;
        {
            let slot = self.slot_mut(idx);
            slot.prev = NIL;
            slot.next = head;
        }
        if head != NIL {
            self.slot_mut(head).prev = idx;
        }
        let list = self.list_mut(queue);
        list.head = idx;
        if list.tail == NIL {
            list.tail = idx;
        }
        list.len += 1;
    }

    fn unlink(&mut self, idx: u32) {
        let (queue, prev, next) = {
            let slot = self.slot(idx);
            (slot.queue, slot.prev, slot.next)
        };
        if prev != NIL {
            self.slot_mut(prev).next = next;
        }
        if next != NIL {
            self.slot_mut(next).prev = prev;
        }
        let list = self.list_mut(queue);
        if list.head == idx {
            list.head = next;
        }
        if list.tail == idx {
            list.tail = prev;
        }
        list.len -= 1;
        let slot = self.slot_mut(idx);
        slot.prev = NIL;
        slot.next = NIL;
    }

    fn slot(&self, idx: u32) -> &Slot<T> {
        match &self.slots[idx as usize] {
            Some(slot) => slot,
            None => unreachable!("cache slot {idx} is free"),
        }
    }

    fn slot_mut(&mut self, idx: u32) -> &mut Slot<T> {
        match &mut self.slots[idx as usize] {
            Some(slot) => slot,
            None => unreachable!("cache slot {idx} is free"),
        }
    }
}
