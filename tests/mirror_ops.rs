//! Reference-equivalence harness: every operation is mirrored into a
//! `std::collections::HashMap` and the two are compared after each step,
//! including operations injected at chosen points inside a `range` walk.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use swisstable_rs::{IdentityHash, Key, KeyHash, Map, Value, PINNED_ITER_SEED};

struct MirrorMap<H: KeyHash> {
    map: Map<H>,
    mirror: HashMap<Key, Value>,
}

impl<H: KeyHash> MirrorMap<H> {
    fn new(map: Map<H>) -> Self {
        Self {
            map,
            mirror: HashMap::new(),
        }
    }

    fn get(&self, key: Key) {
        assert_eq!(
            self.map.get(key),
            self.mirror.get(&key).copied(),
            "get({key}) diverged"
        );
    }

    fn set(&mut self, key: Key, value: Value) {
        self.map.set(key, value);
        self.mirror.insert(key, value);
    }

    fn delete(&mut self, key: Key) {
        self.map.delete(key);
        self.mirror.remove(&key);
    }

    fn check_len(&self) {
        assert_eq!(self.map.len(), self.mirror.len(), "len diverged");
    }

    fn check_full_equivalence(&self) {
        self.check_len();
        for (&key, &value) in &self.mirror {
            assert_eq!(self.map.get(key), Some(value), "key {key} diverged");
        }
        let mut surfaced = 0usize;
        self.map.range(|key, value| {
            assert_eq!(
                self.mirror.get(&key),
                Some(&value),
                "range surfaced stale pair ({key}, {value})"
            );
            surfaced += 1;
            true
        });
        assert_eq!(surfaced, self.mirror.len(), "range missed or repeated keys");
    }
}

#[derive(Clone, Debug)]
enum Op {
    Get(Key),
    Set(Key, Value),
    Delete(Key),
    Len,
}

fn apply<H: KeyHash>(mm: &mut MirrorMap<H>, op: &Op) {
    match *op {
        Op::Get(key) => mm.get(key),
        Op::Set(key, value) => mm.set(key, value),
        Op::Delete(key) => mm.delete(key),
        Op::Len => mm.check_len(),
    }
}

// Small key domain so collisions, tombstone reuse, and growth all trigger.
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..64).prop_map(Op::Get),
        ((0i64..64), any::<i64>()).prop_map(|(key, value)| Op::Set(key, value)),
        (0i64..64).prop_map(Op::Delete),
        Just(Op::Len),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn op_chains_match_reference(ops in proptest::collection::vec(op_strategy(), 1..400)) {
        let mut mm = MirrorMap::new(Map::with_hasher(0, IdentityHash, PINNED_ITER_SEED));
        for op in &ops {
            apply(&mut mm, op);
        }
        mm.check_full_equivalence();
    }

    #[test]
    fn op_chains_inside_range_match_reference(
        start_keys in proptest::collection::hash_set(0i64..64, 0..40),
        script in proptest::collection::vec((0u16..8, op_strategy()), 0..60),
    ) {
        let map = Map::with_hasher(0, IdentityHash, PINNED_ITER_SEED);
        let mut mm = MirrorMap::new(map);
        for &key in &start_keys {
            mm.set(key, key);
        }
        run_scripted_range(&mut mm, script);
        mm.check_full_equivalence();
    }
}

/// Drives a `range` walk while applying scripted operations at the given
/// emission indices, tracking which keys are required, allowed, or forbidden
/// the way the surrounding map semantics demand:
/// - a key present at the start and never deleted must surface exactly once;
/// - a key must never surface while it stands deleted;
/// - surfacing twice is legal only after a delete-then-reinsert cycle.
fn run_scripted_range<H: KeyHash>(mm: &mut MirrorMap<H>, mut script: Vec<(u16, Op)>) {
    script.sort_by_key(|(index, _)| *index);

    let mut must_see: HashSet<Key> = mm.mirror.keys().copied().collect();
    let mut deleted: HashSet<Key> = HashSet::new();
    let mut readded: HashSet<Key> = HashSet::new();
    let mut seen: HashMap<Key, u32> = HashMap::new();

    let MirrorMap { map, mirror } = mm;
    let mut emission: u16 = 0;
    map.range(|key, value| {
        assert!(
            !deleted.contains(&key),
            "key {key} surfaced while deleted"
        );
        assert_eq!(
            mirror.get(&key),
            Some(&value),
            "range surfaced stale pair ({key}, {value})"
        );
        let count = seen.entry(key).or_insert(0);
        *count += 1;
        assert!(
            *count == 1 || readded.contains(&key),
            "key {key} surfaced {count} times without a delete/reinsert cycle"
        );

        while let Some((index, op)) = script.first().cloned() {
            if index != emission {
                break;
            }
            match op {
                Op::Get(k) => {
                    assert_eq!(map.get(k), mirror.get(&k).copied(), "get({k}) diverged");
                }
                Op::Set(k, v) => {
                    map.set(k, v);
                    mirror.insert(k, v);
                    if deleted.remove(&k) {
                        readded.insert(k);
                    }
                }
                Op::Delete(k) => {
                    map.delete(k);
                    mirror.remove(&k);
                    must_see.remove(&k);
                    deleted.insert(k);
                    readded.remove(&k);
                }
                Op::Len => {
                    assert_eq!(map.len(), mirror.len(), "len diverged");
                }
            }
            script.remove(0);
        }
        emission += 1;
        true
    });

    for key in &must_see {
        assert!(
            seen.contains_key(key),
            "key {key} was present throughout the walk but never surfaced"
        );
    }
}

#[test]
fn test_scripted_range_smoke() {
    let map = Map::with_hasher(100, IdentityHash, PINNED_ITER_SEED);
    let mut mm = MirrorMap::new(map);
    mm.set(100, 100);
    mm.set(101, 101);
    mm.set(102, 102);
    run_scripted_range(
        &mut mm,
        vec![
            (0, Op::Get(1)),
            (0, Op::Get(2)),
            (1, Op::Set(3, 3)),
            (2, Op::Delete(100)),
        ],
    );
    mm.check_full_equivalence();
}

#[test]
fn test_randomized_soup_with_default_hash() {
    let mut rng = StdRng::seed_from_u64(123);
    let mut mm = MirrorMap::new(Map::new(4));
    for step in 0..30_000 {
        let key = rng.gen_range(0..512);
        match rng.gen_range(0..10) {
            0..=4 => mm.set(key, rng.gen()),
            5..=7 => mm.get(key),
            8 => mm.delete(key),
            _ => mm.check_len(),
        }
        if step % 5_000 == 0 {
            mm.check_full_equivalence();
        }
    }
    mm.check_full_equivalence();
}

#[test]
fn test_randomized_soup_with_identity_hash() {
    // Sequential-ish keys under an identity hash cluster into few groups.
    let mut rng = StdRng::seed_from_u64(7);
    let mut mm = MirrorMap::new(Map::with_hasher(0, IdentityHash, PINNED_ITER_SEED));
    for _ in 0..30_000 {
        let key = rng.gen_range(0..256) * 16;
        match rng.gen_range(0..10) {
            0..=4 => mm.set(key, key),
            5..=7 => mm.get(key),
            8 => mm.delete(key),
            _ => mm.check_len(),
        }
    }
    mm.check_full_equivalence();
}
