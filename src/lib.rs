//! swisstable_rs: a swiss-table hash map from 64-bit keys to 64-bit values.
//!
//! Control bytes are scanned sixteen at a time (SSE2 where available, a SWAR
//! fallback elsewhere), groups are probed across with triangular numbers, and
//! resizing is incremental: writes move a bounded number of groups out of the
//! frozen old table, so an iteration started before the resize keeps walking
//! a consistent snapshot while the map keeps absorbing writes.
//!
//! The map is single-threaded. All mutation goes through interior mutability
//! (`Cell`, `UnsafeCell`, `Rc`), which also makes the type `!Send + !Sync`.

use std::cell::{Cell, UnsafeCell};
use std::rc::Rc;

use ahash::RandomState;

// ================================================================================================
// TRACING HOOK
// ================================================================================================

// Compiles away entirely unless the `trace` feature is enabled.
#[cfg(feature = "trace")]
macro_rules! trace_event {
    ($($arg:tt)*) => { tracing::trace!($($arg)*) };
}

#[cfg(not(feature = "trace"))]
macro_rules! trace_event {
    ($($arg:tt)*) => {};
}

// ================================================================================================
// CONSTANTS
// ================================================================================================

/// Number of control bytes (and slots) scanned together in one probe step.
pub const GROUP_WIDTH: usize = 16;

/// Control byte for a slot that has never held a value since the last time a
/// probe chain could pass through it.
const CONTROL_EMPTY: u8 = 0xff;

/// Control byte for a tombstone: the slot is free but a probe chain may still
/// run through its group.
const CONTROL_DELETED: u8 = 0x80;

/// Low seven bits of a stored control byte carry the H2 tag.
const H2_MASK: u8 = 0x7f;

/// Minimum underlying table length (one full group).
const MIN_TABLE_LEN: usize = 16;

/// Groups an incremental-resize write may evacuate before falling back to the
/// targeted move of a displaced key.
const MOVE_BUDGET: i64 = 2;

/// Upper bound on status-vector entries one write's sweep may visit.
const SWEEP_GROUPS_PER_WRITE: u64 = 1000;

/// Maps constructed with this seed iterate from a fixed starting position
/// instead of a randomized one, which makes walks reproducible in tests.
pub const PINNED_ITER_SEED: u64 = 42;

// Growth status bits, one byte per group of the old table.
const EVACUATED: u8 = 1 << 0;
const CHAIN_EVACUATED: u8 = 1 << 1;
const CUR_HAS_DISPLACED: u8 = 1 << 2;

// ================================================================================================
// BYTE MATCHING
// ================================================================================================

/// Compares `target` against the first sixteen bytes of `window` and returns
/// a bitmask with bit `i` set iff `window[i] == target`, plus an `ok` flag.
/// A window shorter than one group yields `(0, false)`.
#[inline(always)]
pub fn match_byte(target: u8, window: &[u8]) -> (u32, bool) {
    if window.len() < GROUP_WIDTH {
        return (0, false);
    }

    #[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
    {
        // SAFETY: the length check above guarantees sixteen readable bytes.
        return (unsafe { match_byte_sse2(target, window.as_ptr()) }, true);
    }

    #[allow(unreachable_code)]
    {
        (match_byte_swar(target, window), true)
    }
}

#[cfg(all(target_arch = "x86_64", target_feature = "sse2"))]
#[inline(always)]
unsafe fn match_byte_sse2(target: u8, window: *const u8) -> u32 {
    use std::arch::x86_64::*;
    let needle = _mm_set1_epi8(target as i8);
    let data = _mm_loadu_si128(window as *const __m128i);
    let hits = _mm_cmpeq_epi8(data, needle);
    _mm_movemask_epi8(hits) as u32
}

const LOW_SEVEN: u64 = 0x7f7f_7f7f_7f7f_7f7f;

/// Portable fallback: two 8-byte words, zero-byte marking, bit packing.
#[inline(always)]
fn match_byte_swar(target: u8, window: &[u8]) -> u32 {
    let spread = broadcast(target);
    let mut mask = 0u32;
    for half in 0..2 {
        let base = half * 8;
        let word = u64::from_le_bytes(window[base..base + 8].try_into().unwrap());
        let mut marked = zero_byte_marks(word ^ spread);
        while marked != 0 {
            mask |= 1 << (first_marked_byte_index(marked) + base);
            marked &= marked - 1;
        }
    }
    mask
}

#[inline(always)]
fn broadcast(byte: u8) -> u64 {
    (byte as u64) * 0x0101_0101_0101_0101
}

/// Sets the high bit of every byte of `word` that is exactly zero. Unlike the
/// subtract-and-mask trick this form is carry-free, so it never flags a
/// non-zero byte.
#[inline(always)]
fn zero_byte_marks(word: u64) -> u64 {
    !(((word & LOW_SEVEN) + LOW_SEVEN) | word | LOW_SEVEN)
}

#[inline(always)]
fn first_marked_byte_index(word: u64) -> usize {
    (word.trailing_zeros() >> 3) as usize
}

// ================================================================================================
// KEYS, VALUES, HASHING
// ================================================================================================

pub type Key = i64;
pub type Value = i64;

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
struct KV {
    key: Key,
    value: Value,
}

/// Keyed hash over map keys. Implementations must be pure: the same
/// `(key, seed)` pair always produces the same output. Distribution quality
/// affects probe lengths, never correctness.
pub trait KeyHash {
    fn hash(&self, key: Key, seed: u64) -> u64;
}

/// Default hash, backed by `ahash` keyed from the map seed.
#[derive(Clone)]
pub struct DefaultKeyHash {
    state: RandomState,
}

impl DefaultKeyHash {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            state: RandomState::with_seeds(
                seed,
                seed ^ 0x243f_6a88_85a3_08d3,
                seed ^ 0x1319_8a2e_0370_7344,
                seed ^ 0xa409_3822_299f_31d0,
            ),
        }
    }
}

impl Default for DefaultKeyHash {
    fn default() -> Self {
        Self {
            state: RandomState::new(),
        }
    }
}

impl KeyHash for DefaultKeyHash {
    #[inline(always)]
    fn hash(&self, key: Key, _seed: u64) -> u64 {
        self.state.hash_one(key)
    }
}

/// Returns the key bits unchanged. Useful in tests for steering keys into
/// chosen groups, and as a worst case for clustered key ranges.
#[derive(Clone, Copy, Default)]
pub struct IdentityHash;

impl KeyHash for IdentityHash {
    #[inline(always)]
    fn hash(&self, key: Key, _seed: u64) -> u64 {
        key as u64
    }
}

/// Maps every key to zero: all keys share one probe chain. Pathological by
/// design, for exercising collision and displacement handling.
#[derive(Clone, Copy, Default)]
pub struct ZeroHash;

impl KeyHash for ZeroHash {
    #[inline(always)]
    fn hash(&self, _key: Key, _seed: u64) -> u64 {
        0
    }
}

#[inline(always)]
fn is_stored(control: u8) -> bool {
    control & 0x80 == 0
}

// ================================================================================================
// FIXED TABLE
// ================================================================================================

/// An open-addressed table of fixed power-of-two length. Does not grow; the
/// map swaps in a larger one instead. Interior mutability keeps every access
/// going through `&self` so that snapshots handed to iterators stay usable
/// while the map continues to write.
struct FixedTable {
    control: UnsafeCell<Box<[u8]>>,
    slots: UnsafeCell<Box<[KV]>>,
    group_mask: u64,
    /// Hash bits consumed by the group selector; H2 is the seven bits above.
    h2_shift: u32,
    delete_count: Cell<i64>,
    h2_false_positives: Cell<u64>,
    extra_groups: Cell<u64>,
}

/// Where an insertion landed and whether it replaced an existing entry.
struct SlotWrite {
    index: usize,
    existing: bool,
}

impl FixedTable {
    fn with_table_len(table_len: usize) -> Self {
        debug_assert!(
            table_len >= MIN_TABLE_LEN && table_len.is_power_of_two(),
            "table length {table_len} is not a power of two >= {MIN_TABLE_LEN}"
        );
        let groups = table_len / GROUP_WIDTH;
        Self {
            control: UnsafeCell::new(vec![CONTROL_EMPTY; table_len].into_boxed_slice()),
            slots: UnsafeCell::new(vec![KV::default(); table_len].into_boxed_slice()),
            group_mask: (groups - 1) as u64,
            h2_shift: groups.trailing_zeros(),
            delete_count: Cell::new(0),
            h2_false_positives: Cell::new(0),
            extra_groups: Cell::new(0),
        }
    }

    #[inline(always)]
    fn table_len(&self) -> usize {
        // SAFETY: single-threaded; no mutable access is live across this read.
        unsafe { (&*self.control.get()).len() }
    }

    #[inline(always)]
    fn group_count(&self) -> u64 {
        self.group_mask + 1
    }

    #[inline(always)]
    fn control(&self, index: usize) -> u8 {
        // SAFETY: single-threaded; no mutable access is live across this read.
        unsafe { (*self.control.get())[index] }
    }

    #[inline(always)]
    fn set_control(&self, index: usize, byte: u8) {
        // SAFETY: single-threaded; the mutable access ends with this statement.
        unsafe {
            (*self.control.get())[index] = byte;
        }
    }

    /// Control bytes from the start of `group` to the end of the table. The
    /// borrow must not be held across a `set_control` call.
    #[inline(always)]
    fn control_window(&self, group: u64) -> &[u8] {
        // SAFETY: single-threaded; callers consume the slice immediately.
        unsafe { &(&*self.control.get())[(group as usize) * GROUP_WIDTH..] }
    }

    #[inline(always)]
    fn slot(&self, index: usize) -> KV {
        // SAFETY: single-threaded; `KV` is `Copy`, the read ends here.
        unsafe { (*self.slots.get())[index] }
    }

    #[inline(always)]
    fn set_slot(&self, index: usize, kv: KV) {
        // SAFETY: single-threaded; the mutable access ends with this statement.
        unsafe {
            (*self.slots.get())[index] = kv;
        }
    }

    #[inline(always)]
    fn h1(&self, h: u64) -> u64 {
        h & self.group_mask
    }

    #[inline(always)]
    fn h2(&self, h: u64) -> u8 {
        ((h >> self.h2_shift) as u8) & H2_MASK
    }

    /// Rebuilds the low `h2_shift + 7` hash bits of a stored entry from its
    /// control byte and group, the inverse of the H1/H2 split. Lets a probe
    /// run without rehashing the key.
    #[inline(always)]
    fn reconstruct_hash(&self, control: u8, group: u64) -> u64 {
        debug_assert!(is_stored(control));
        ((control as u64) << self.h2_shift) | group
    }

    #[inline(always)]
    fn group_has_empty(&self, group: u64) -> bool {
        let (empties, _) = match_byte(CONTROL_EMPTY, self.control_window(group));
        empties != 0
    }

    /// Returns the slot index holding `key`, probing by triangular numbers
    /// from the natural group. `h` only feeds the group selector and H2 tag,
    /// so a reconstructed partial hash works here too.
    fn find(&self, key: Key, h: u64) -> Option<usize> {
        let h2 = self.h2(h);
        let mut group = self.h1(h);
        let mut probe: u64 = 0;
        loop {
            let (mut hits, ok) = match_byte(h2, self.control_window(group));
            debug_assert!(ok, "control window shorter than a group");
            while hits != 0 {
                let index = (group as usize) * GROUP_WIDTH + hits.trailing_zeros() as usize;
                if self.slot(index).key == key {
                    return Some(index);
                }
                // Tag collision with a different key; rare with 7 tag bits.
                self.h2_false_positives
                    .set(self.h2_false_positives.get() + 1);
                hits &= hits - 1;
            }
            let (empties, _) = match_byte(CONTROL_EMPTY, self.control_window(group));
            if empties != 0 {
                // The probe chain ends at the first group with an empty slot.
                return None;
            }
            self.extra_groups.set(self.extra_groups.get() + 1);
            probe += 1;
            debug_assert!(probe <= self.group_mask, "probe walked past every group");
            group = (group + probe) & self.group_mask;
        }
    }

    /// Inserts or overwrites. The caller owns the live-element count; this
    /// only maintains the tombstone count.
    fn insert(&self, key: Key, value: Value, h: u64) -> SlotWrite {
        let h2 = self.h2(h);
        let mut group = self.h1(h);
        let mut probe: u64 = 0;
        loop {
            let (mut hits, ok) = match_byte(h2, self.control_window(group));
            debug_assert!(ok, "control window shorter than a group");
            while hits != 0 {
                let index = (group as usize) * GROUP_WIDTH + hits.trailing_zeros() as usize;
                if self.slot(index).key == key {
                    self.set_slot(index, KV { key, value });
                    return SlotWrite {
                        index,
                        existing: true,
                    };
                }
                hits &= hits - 1;
            }
            let (empties, _) = match_byte(CONTROL_EMPTY, self.control_window(group));
            if empties != 0 {
                // The chain ends in this group. With no tombstones there is
                // nothing earlier to reclaim, and at the natural group there
                // is no earlier group to rewind to. Otherwise restart from
                // the natural group and take the first free position, which
                // keeps chains short.
                let index = if self.delete_count.get() == 0 || probe == 0 {
                    (group as usize) * GROUP_WIDTH + empties.trailing_zeros() as usize
                } else {
                    self.first_free_slot(h)
                };
                if self.control(index) == CONTROL_DELETED {
                    self.delete_count.set(self.delete_count.get() - 1);
                }
                self.set_control(index, h2);
                self.set_slot(index, KV { key, value });
                return SlotWrite {
                    index,
                    existing: false,
                };
            }
            probe += 1;
            debug_assert!(probe <= self.group_mask, "probe walked past every group");
            group = (group + probe) & self.group_mask;
        }
    }

    /// First empty-or-deleted position along the probe sequence of `h`.
    /// Only called when the chain is known to terminate.
    fn first_free_slot(&self, h: u64) -> usize {
        let mut group = self.h1(h);
        let mut probe: u64 = 0;
        loop {
            let window = self.control_window(group);
            let (empties, _) = match_byte(CONTROL_EMPTY, window);
            let (deleted, _) = match_byte(CONTROL_DELETED, window);
            let free = empties | deleted;
            if free != 0 {
                return (group as usize) * GROUP_WIDTH + free.trailing_zeros() as usize;
            }
            probe += 1;
            debug_assert!(probe <= self.group_mask, "probe walked past every group");
            group = (group + probe) & self.group_mask;
        }
    }

    /// Removes `key` if present; returns whether a slot was released.
    fn remove(&self, key: Key, h: u64) -> bool {
        let Some(index) = self.find(key, h) else {
            return false;
        };
        let group = (index / GROUP_WIDTH) as u64;
        if self.group_has_empty(group) {
            // No probe chain can pass through a group that still has an
            // empty slot, so the position can be cleared outright.
            self.set_control(index, CONTROL_EMPTY);
        } else {
            self.set_control(index, CONTROL_DELETED);
            self.delete_count.set(self.delete_count.get() + 1);
        }
        self.set_slot(index, KV::default());
        true
    }

    /// Resets every position to empty without changing the table size.
    fn wipe(&self) {
        // SAFETY: single-threaded; no reference into the arrays is live here.
        unsafe {
            (*self.control.get()).fill(CONTROL_EMPTY);
            (*self.slots.get()).fill(KV::default());
        }
        self.delete_count.set(0);
    }

    #[cfg(test)]
    fn count_stored(&self) -> usize {
        (0..self.table_len())
            .filter(|&i| is_stored(self.control(i)))
            .count()
    }
}

// ================================================================================================
// GROWTH STATUS
// ================================================================================================

/// One packed status byte per group of the frozen old table.
struct GrowthFlags {
    group_mask: u64,
    flags: Box<[Cell<u8>]>,
}

impl GrowthFlags {
    fn for_table(old: &FixedTable) -> Self {
        Self {
            group_mask: old.group_mask,
            flags: vec![Cell::new(0); old.group_count() as usize].into_boxed_slice(),
        }
    }

    #[inline(always)]
    fn has(&self, group: u64, bit: u8) -> bool {
        self.flags[group as usize].get() & bit != 0
    }

    #[inline(always)]
    fn raise(&self, group: u64, bit: u8) {
        let cell = &self.flags[group as usize];
        cell.set(cell.get() | bit);
    }

    #[inline(always)]
    fn evacuated(&self, group: u64) -> bool {
        self.has(group, EVACUATED)
    }

    #[inline(always)]
    fn chain_evacuated(&self, group: u64) -> bool {
        self.has(group, CHAIN_EVACUATED)
    }

    #[inline(always)]
    fn cur_has_displaced(&self, group: u64) -> bool {
        self.has(group, CUR_HAS_DISPLACED)
    }

    /// Records that an entry landed outside its natural group of the new
    /// table. Indexed through the old group mask so iterators know when the
    /// control byte alone no longer reconstructs an entry's hash bits.
    #[inline(always)]
    fn note_displaced(&self, cur: &FixedTable, h: u64, index: usize) {
        let landed = (index / GROUP_WIDTH) as u64;
        if landed != cur.h1(h) {
            self.raise(landed & self.group_mask, CUR_HAS_DISPLACED);
        }
    }
}

// ================================================================================================
// MAP
// ================================================================================================

/// Hash map from `i64` to `i64` with incremental resizing.
///
/// While a resize is in flight the previous table is frozen: its control and
/// slot arrays are never written again, only the per-group status vector
/// advances. Iterators hold `Rc` snapshots of both tables and therefore
/// survive any number of later resizes.
pub struct Map<H: KeyHash = DefaultKeyHash> {
    current: UnsafeCell<Rc<FixedTable>>,
    old: UnsafeCell<Option<Rc<FixedTable>>>,
    grow_status: UnsafeCell<Option<Rc<GrowthFlags>>>,
    sweep_cursor: Cell<u64>,
    elem_count: Cell<i64>,
    resize_threshold: Cell<i64>,
    resize_enabled: Cell<bool>,
    gets: Cell<u64>,
    hasher: H,
    seed: u64,
}

/// Lifetime probe counters, readable through [`Map::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProbeStats {
    pub gets: u64,
    pub h2_false_positives: u64,
    pub extra_groups: u64,
}

impl Map<DefaultKeyHash> {
    /// Creates a map sized so that `capacity` entries fit without resizing.
    pub fn new(capacity: usize) -> Self {
        let seed = RandomState::new().hash_one(capacity as u64);
        Self::with_hasher(capacity, DefaultKeyHash::with_seed(seed), seed)
    }
}

impl<H: KeyHash> Map<H> {
    /// Creates a map with an explicit hash implementation and seed. A seed of
    /// [`PINNED_ITER_SEED`] additionally pins the iteration starting position.
    pub fn with_hasher(capacity: usize, hasher: H, seed: u64) -> Self {
        let table_len = calc_table_len(capacity);
        trace_event!(table_len, "allocating initial table");
        Self {
            current: UnsafeCell::new(Rc::new(FixedTable::with_table_len(table_len))),
            old: UnsafeCell::new(None),
            grow_status: UnsafeCell::new(None),
            sweep_cursor: Cell::new(0),
            elem_count: Cell::new(0),
            resize_threshold: Cell::new(calc_resize_threshold(table_len)),
            resize_enabled: Cell::new(true),
            gets: Cell::new(0),
            hasher,
            seed,
        }
    }

    // ============================================================================================
    // PUBLIC API METHODS
    // ============================================================================================

    /// Returns the value stored under `key`, if any.
    pub fn get(&self, key: Key) -> Option<Value> {
        self.gets.set(self.gets.get() + 1);
        let h = self.hash_key(key);
        let cur = self.cur();
        let (Some(old), Some(flags)) = (self.old_table(), self.growth_flags()) else {
            return cur.find(key, h).map(|i| cur.slot(i).value);
        };

        let nat_old = h & old.group_mask;
        if flags.chain_evacuated(nat_old) {
            return cur.find(key, h).map(|i| cur.slot(i).value);
        }
        if !flags.evacuated(nat_old) {
            // Nothing from this natural group has moved yet; the old table
            // still holds the authoritative entry.
            return old.find(key, h).map(|i| old.slot(i).value);
        }
        if let Some(i) = cur.find(key, h) {
            return Some(cur.slot(i).value);
        }
        // The natural group moved but its chain extends into groups that may
        // not have. A displaced entry sitting in such a group is still live.
        match old.find(key, h) {
            Some(i) => {
                let dg = (i / GROUP_WIDTH) as u64;
                if dg != nat_old && !flags.evacuated(dg) {
                    Some(old.slot(i).value)
                } else {
                    None
                }
            }
            None => None,
        }
    }

    /// Inserts `value` under `key`, overwriting any previous value.
    pub fn set(&self, key: Key, value: Value) {
        let h = self.hash_key(key);
        if self.is_growing() {
            self.move_for(key, h);
        }
        if self.resize_enabled.get() {
            let cur = self.cur();
            if self.elem_count.get() + cur.delete_count.get() >= self.resize_threshold.get()
                && cur.find(key, h).is_none()
            {
                // A fresh slot is about to be consumed past the load limit.
                if self.is_growing() {
                    self.finish_growth();
                }
                self.start_resize();
                self.move_for(key, h);
            }
        }
        let cur = self.cur();
        let write = cur.insert(key, value, h);
        if !write.existing {
            self.elem_count.set(self.elem_count.get() + 1);
            if let Some(flags) = self.growth_flags() {
                flags.note_displaced(&cur, h, write.index);
            }
        }
    }

    /// Removes `key`; a no-op when the key is absent.
    pub fn delete(&self, key: Key) {
        let h = self.hash_key(key);
        if self.is_growing() {
            self.move_for(key, h);
        }
        if self.cur().remove(key, h) {
            self.elem_count.set(self.elem_count.get() - 1);
        }
    }

    /// Live element count, O(1).
    pub fn len(&self) -> usize {
        self.elem_count.get() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.elem_count.get() == 0
    }

    pub fn contains_key(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    /// Drops every entry, keeping the current table size. A live iterator
    /// stops surfacing anything that has not been re-inserted since.
    pub fn clear(&self) {
        if let (Some(old), Some(flags)) = (self.old_table(), self.growth_flags()) {
            // Entries still resident in the old table are gone as well;
            // marking every group moved lets live iterators skip them, then
            // the resize retires without copying anything.
            for group in 0..=flags.group_mask {
                flags.raise(group, EVACUATED | CHAIN_EVACUATED);
            }
            self.complete_growth(&old);
        }
        self.cur().wipe();
        self.elem_count.set(0);
    }

    /// Probe counter snapshot. Group-hop and tag-collision counts fold into
    /// the surviving table when a resize completes.
    pub fn stats(&self) -> ProbeStats {
        let cur = self.cur();
        let (mut fp, mut eg) = (cur.h2_false_positives.get(), cur.extra_groups.get());
        if let Some(old) = self.old_table() {
            fp += old.h2_false_positives.get();
            eg += old.extra_groups.get();
        }
        ProbeStats {
            gets: self.gets.get(),
            h2_false_positives: fp,
            extra_groups: eg,
        }
    }

    /// Calls `f` once for every surfaced entry, stopping early when `f`
    /// returns `false`. `f` may read and write this map freely; entries it
    /// deletes before they are visited will not be surfaced, and entries it
    /// inserts may or may not be.
    pub fn range<F: FnMut(Key, Value) -> bool>(&self, mut f: F) {
        for (key, value) in self.iter() {
            if !f(key, value) {
                break;
            }
        }
    }

    /// Iterator over `(key, value)` pairs in randomized order. The map may be
    /// written while the iterator is live; every key present from start to
    /// finish of the walk is yielded exactly once.
    pub fn iter(&self) -> Iter<'_, H> {
        let rand_bits = if self.seed == PINNED_ITER_SEED {
            0
        } else {
            RandomState::new().hash_one(0u64)
        };
        let old_snap = match (self.old_table(), self.growth_flags()) {
            (Some(old), Some(flags)) => Some((old, flags)),
            _ => None,
        };
        Iter {
            map: self,
            old_snap,
            cur_snap: self.cur(),
            rand_bits,
            phase: IterPhase::OldTable,
            groups_visited: 0,
            offsets_visited: 0,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.iter().map(|(key, _)| key)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.iter().map(|(_, value)| value)
    }

    // ============================================================================================
    // PRIVATE HELPER METHODS
    // ============================================================================================

    #[inline(always)]
    fn hash_key(&self, key: Key) -> u64 {
        self.hasher.hash(key, self.seed)
    }

    #[inline(always)]
    fn cur(&self) -> Rc<FixedTable> {
        // SAFETY: single-threaded; the cell is only replaced from `&self`
        // methods and no reference into it outlives this clone.
        unsafe { Rc::clone(&*self.current.get()) }
    }

    #[inline(always)]
    fn old_table(&self) -> Option<Rc<FixedTable>> {
        // SAFETY: as in `cur`.
        unsafe { (*self.old.get()).clone() }
    }

    #[inline(always)]
    fn growth_flags(&self) -> Option<Rc<GrowthFlags>> {
        // SAFETY: as in `cur`.
        unsafe { (*self.grow_status.get()).clone() }
    }

    #[inline(always)]
    fn is_growing(&self) -> bool {
        // SAFETY: as in `cur`.
        unsafe { (*self.old.get()).is_some() }
    }

    // ============================================================================================
    // INCREMENTAL GROWTH
    // ============================================================================================

    /// Freezes the current table as `old` and installs an empty table of
    /// twice the length. From here on the old arrays are never written;
    /// writes drain them group by group through `move_for`.
    fn start_resize(&self) {
        let old = self.cur();
        let new_len = old.table_len() * 2;
        trace_event!(new_len, "starting incremental resize");
        let flags = GrowthFlags::for_table(&old);
        // SAFETY: single-threaded; callers re-read the cells after this call.
        unsafe {
            *self.current.get() = Rc::new(FixedTable::with_table_len(new_len));
            *self.old.get() = Some(old);
            *self.grow_status.get() = Some(Rc::new(flags));
        }
        self.resize_threshold.set(self.resize_threshold.get() * 2);
        self.sweep_cursor.set(0);
    }

    /// Bounded evacuation run ahead of a write to `key`. Guarantees that by
    /// the time the write probes the current table, the authoritative copy of
    /// `key` is no longer stranded in an unmoved old group.
    fn move_for(&self, key: Key, h: u64) {
        let (Some(old), Some(flags)) = (self.old_table(), self.growth_flags()) else {
            return;
        };
        let nat_old = h & old.group_mask;
        let mut credits = MOVE_BUDGET;
        if !flags.evacuated(nat_old) {
            self.move_group(&old, &flags, nat_old);
            credits -= 1;
        }
        if !flags.chain_evacuated(nat_old) {
            credits = self.move_chain(&old, &flags, nat_old, 1, credits);
        }
        if !flags.chain_evacuated(nat_old) {
            // The chain walk ran out of budget, so the key may still sit in a
            // displaced group further along it. Pin that group down directly;
            // credits may go negative here.
            if let Some(index) = old.find(key, h) {
                let dg = (index / GROUP_WIDTH) as u64;
                if dg != nat_old && !flags.evacuated(dg) {
                    self.move_group(&old, &flags, dg);
                    credits -= 1;
                }
            }
        }
        self.sweep(&old, &flags, credits);
    }

    /// Reinserts every stored entry of old group `group` into the current
    /// table. Entries were counted when they first landed in the map, so the
    /// live-element count is untouched.
    fn move_group(&self, old: &FixedTable, flags: &GrowthFlags, group: u64) {
        debug_assert!(!flags.evacuated(group));
        let base = (group as usize) * GROUP_WIDTH;
        for offset in 0..GROUP_WIDTH {
            let control = old.control(base + offset);
            if !is_stored(control) {
                continue;
            }
            let kv = old.slot(base + offset);
            let h = self.hash_key(kv.key);
            let cur = self.cur();
            let write = cur.insert(kv.key, kv.value, h);
            debug_assert!(
                !write.existing,
                "moved entry already present in the new table"
            );
            flags.note_displaced(&cur, h, write.index);
        }
        flags.raise(group, EVACUATED);
        if old.group_has_empty(group) {
            // The probe chain starting here also ends here.
            flags.raise(group, CHAIN_EVACUATED);
        }
        trace_event!(group, "evacuated group");
    }

    /// Walks the probe chain of `origin` starting after `start_probe` steps,
    /// evacuating unmoved groups while credits last. Marks the origin
    /// chain-evacuated once a group with an empty slot is reached with every
    /// group on the way moved. Returns the remaining credits.
    fn move_chain(
        &self,
        old: &FixedTable,
        flags: &GrowthFlags,
        origin: u64,
        start_probe: u64,
        mut credits: i64,
    ) -> i64 {
        let mut group = origin;
        for step in 1..=start_probe {
            group = (group + step) & old.group_mask;
        }
        let mut probe = start_probe;
        loop {
            if !flags.evacuated(group) {
                if credits <= 0 {
                    return credits;
                }
                self.move_group(old, flags, group);
                credits -= 1;
            }
            if old.group_has_empty(group) {
                flags.raise(origin, CHAIN_EVACUATED);
                return credits;
            }
            probe += 1;
            debug_assert!(probe <= old.group_mask, "chain walked past every group");
            group = (group + probe) & old.group_mask;
        }
    }

    /// Advances the background cursor over the status vector, finishing
    /// chains as long as credits allow. The chain-evacuated check runs before
    /// any credit is spent: a walk with nothing left to move can still mark
    /// finished chains and push the cursor forward.
    fn sweep(&self, old: &Rc<FixedTable>, flags: &Rc<GrowthFlags>, mut credits: i64) {
        let total = old.group_count();
        let mut cursor = self.sweep_cursor.get();
        let mut visited = 0;
        while cursor < total && visited < SWEEP_GROUPS_PER_WRITE {
            visited += 1;
            if !flags.chain_evacuated(cursor) {
                credits = self.move_chain(old, flags, cursor, 0, credits);
                if !flags.chain_evacuated(cursor) {
                    break;
                }
            }
            cursor += 1;
        }
        self.sweep_cursor.set(cursor);
        if cursor >= total {
            self.complete_growth(old);
        }
    }

    /// Evacuates everything still pending and completes the resize in one go.
    /// Only used when a second resize wants to start before the first one has
    /// drained.
    fn finish_growth(&self) {
        let (Some(old), Some(flags)) = (self.old_table(), self.growth_flags()) else {
            return;
        };
        let total = old.group_count();
        for group in self.sweep_cursor.get()..total {
            if !flags.chain_evacuated(group) {
                self.move_chain(&old, &flags, group, 0, i64::MAX);
                debug_assert!(flags.chain_evacuated(group));
            }
        }
        self.sweep_cursor.set(total);
        self.complete_growth(&old);
    }

    fn complete_growth(&self, old: &FixedTable) {
        let cur = self.cur();
        cur.h2_false_positives
            .set(cur.h2_false_positives.get() + old.h2_false_positives.get());
        cur.extra_groups
            .set(cur.extra_groups.get() + old.extra_groups.get());
        // SAFETY: single-threaded; iterators keep the old table alive through
        // their own `Rc` clones.
        unsafe {
            *self.old.get() = None;
            *self.grow_status.get() = None;
        }
        self.sweep_cursor.set(0);
        trace_event!("resize complete");
    }

    // ============================================================================================
    // TEST SUPPORT
    // ============================================================================================

    #[cfg(test)]
    fn disable_resizing(&self) {
        self.resize_enabled.set(false);
    }

    #[cfg(test)]
    fn table_len(&self) -> usize {
        self.cur().table_len()
    }
}

// ================================================================================================
// ITERATION
// ================================================================================================

enum IterPhase {
    OldTable,
    CurrentTable,
    Done,
}

/// Stateful walk over snapshots of the map's tables.
///
/// Entries still resident in the frozen old table surface with their old
/// value; entries that were already evacuated surface through a lookup in
/// live state, so an overwrite or delete landing mid-walk is honored. The
/// second phase skips every key the old snapshot already accounts for.
pub struct Iter<'m, H: KeyHash = DefaultKeyHash> {
    map: &'m Map<H>,
    old_snap: Option<(Rc<FixedTable>, Rc<GrowthFlags>)>,
    cur_snap: Rc<FixedTable>,
    rand_bits: u64,
    phase: IterPhase,
    groups_visited: u64,
    offsets_visited: usize,
}

impl<H: KeyHash> Iter<'_, H> {
    #[inline(always)]
    fn start_offset(&self) -> usize {
        ((self.rand_bits >> 61) & 0xf) as usize
    }

    /// Next stored position of `table` in randomized start order, or `None`
    /// when every `(group, offset)` pair has been visited.
    fn next_position(&mut self, table: &FixedTable) -> Option<usize> {
        let start_group = self.rand_bits & table.group_mask;
        let start_offset = self.start_offset();
        while self.groups_visited < table.group_count() {
            let group = (start_group + self.groups_visited) & table.group_mask;
            while self.offsets_visited < GROUP_WIDTH {
                let offset = (start_offset + self.offsets_visited) & (GROUP_WIDTH - 1);
                self.offsets_visited += 1;
                let index = (group as usize) * GROUP_WIDTH + offset;
                if is_stored(table.control(index)) {
                    return Some(index);
                }
            }
            self.offsets_visited = 0;
            self.groups_visited += 1;
        }
        None
    }

    fn enter_current_phase(&mut self) {
        self.phase = IterPhase::CurrentTable;
        self.groups_visited = 0;
        self.offsets_visited = 0;
    }
}

impl<H: KeyHash> Iterator for Iter<'_, H> {
    type Item = (Key, Value);

    fn next(&mut self) -> Option<(Key, Value)> {
        loop {
            match self.phase {
                IterPhase::OldTable => {
                    let Some((old, flags)) = self.old_snap.clone() else {
                        self.enter_current_phase();
                        continue;
                    };
                    let Some(index) = self.next_position(&old) else {
                        self.enter_current_phase();
                        continue;
                    };
                    let kv = old.slot(index);
                    let group = (index / GROUP_WIDTH) as u64;
                    if !flags.evacuated(group) {
                        // The group has never been touched in the newer
                        // table, so the frozen entry is authoritative.
                        return Some((kv.key, kv.value));
                    }
                    // Evacuated into some newer generation; surface whatever
                    // the live map holds now (nothing, if it was deleted).
                    let live_cur = self.map.cur();
                    if self.cur_snap.group_mask == live_cur.group_mask || !self.map.is_growing() {
                        let h = self.map.hash_key(kv.key);
                        if let Some(i) = live_cur.find(kv.key, h) {
                            return Some((kv.key, live_cur.slot(i).value));
                        }
                    } else if let Some(value) = self.map.get(kv.key) {
                        return Some((kv.key, value));
                    }
                }
                IterPhase::CurrentTable => {
                    let cur = Rc::clone(&self.cur_snap);
                    let Some(index) = self.next_position(&cur) else {
                        self.phase = IterPhase::Done;
                        return None;
                    };
                    let kv = cur.slot(index);
                    let group = (index / GROUP_WIDTH) as u64;
                    if let Some((old, flags)) = self.old_snap.clone() {
                        let h = if !flags.cur_has_displaced(group & old.group_mask) {
                            // Every entry of this group sits in its natural
                            // group, so the low hash bits fall straight out
                            // of the control byte and group index.
                            cur.reconstruct_hash(cur.control(index), group)
                        } else {
                            self.map.hash_key(kv.key)
                        };
                        if old.find(kv.key, h).is_some() {
                            // Already surfaced while walking the old snapshot.
                            continue;
                        }
                    }
                    let live_cur = self.map.cur();
                    if cur.group_mask == live_cur.group_mask {
                        return Some((kv.key, kv.value));
                    }
                    // A newer generation took over mid-walk; defer to it.
                    if let Some(value) = self.map.get(kv.key) {
                        return Some((kv.key, value));
                    }
                }
                IterPhase::Done => return None,
            }
        }
    }
}

// ================================================================================================
// STANDARD TRAIT IMPLEMENTATIONS
// ================================================================================================

impl<H: KeyHash + Default> Default for Map<H> {
    fn default() -> Self {
        Self::with_hasher(0, H::default(), RandomState::new().hash_one(0u64))
    }
}

impl<'a, H: KeyHash> IntoIterator for &'a Map<H> {
    type Item = (Key, Value);
    type IntoIter = Iter<'a, H>;

    fn into_iter(self) -> Iter<'a, H> {
        self.iter()
    }
}

impl<H: KeyHash + Default> FromIterator<(Key, Value)> for Map<H> {
    fn from_iter<T: IntoIterator<Item = (Key, Value)>>(iter: T) -> Self {
        let map = Self::default();
        for (key, value) in iter {
            map.set(key, value);
        }
        map
    }
}

impl<H: KeyHash> Extend<(Key, Value)> for Map<H> {
    fn extend<T: IntoIterator<Item = (Key, Value)>>(&mut self, iter: T) {
        for (key, value) in iter {
            self.set(key, value);
        }
    }
}

// ================================================================================================
// UTILITY FUNCTIONS
// ================================================================================================

fn next_pow2(mut n: usize) -> usize {
    if n < 2 {
        return 2;
    }
    n -= 1;
    n |= n >> 1;
    n |= n >> 2;
    n |= n >> 4;
    n |= n >> 8;
    n |= n >> 16;
    if usize::BITS == 64 {
        n |= n >> 32;
    }
    n + 1
}

/// Table length for a requested capacity: the smallest power of two that
/// keeps the load at or below 13/16 once `capacity` entries are stored.
fn calc_table_len(capacity: usize) -> usize {
    let needed = capacity.saturating_mul(GROUP_WIDTH).saturating_add(12) / 13;
    next_pow2(needed.max(MIN_TABLE_LEN))
}

fn calc_resize_threshold(table_len: usize) -> i64 {
    (table_len * 13 / 16) as i64
}

// ================================================================================================
// TESTS
// ================================================================================================
