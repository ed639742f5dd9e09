//! Symbol/keyword interning table.
//!
//! Open addressing with tombstones, resized at 50% load, exactly as spec'd
//! for symbol/keyword identity. Interned values compare and hash by the
//! returned handle (a plain integer), never by string content, so `Value`
//! equality for symbols/keywords stays pointer-equality-cheap the way the
//! teacher's pointer-identity `Value` variants are.

use crate::gcstring::fnv1a;
use std::rc::Rc;

/// Opaque handle to an interned string. Two handles are equal iff the
/// interner returned them for equal string content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InternedId(pub u32);

#[derive(Clone)]
enum Slot {
    Empty,
    Tombstone,
    Occupied { hash: u64, text: Rc<str> },
}

/// An open-addressed string interner with linear probing.
///
/// `intern` returns the same `InternedId` for equal byte content, so
/// `InternedId` equality is the cheap identity test the value model relies
/// on for `Symbol`/`Keyword`. `resolve` is the reverse lookup, used for
/// printing and marshalling.
pub struct Interner {
    slots: Vec<Slot>,
    occupied: usize,
    tombstones: usize,
    // ids are stable across resizes: id -> text, independent of slots
    by_id: Vec<Rc<str>>,
    // parallel to `slots`: slot index -> interned id, for fast id lookup on hit
    id_slot_map: Vec<u32>,
}

impl Interner {
    pub fn new() -> Self {
        Interner {
            slots: vec![Slot::Empty; 16],
            occupied: 0,
            tombstones: 0,
            by_id: Vec::new(),
            id_slot_map: vec![u32::MAX; 16],
        }
    }

    pub fn intern(&mut self, text: &str) -> InternedId {
        if self.load_factor_exceeds_half() {
            self.resize();
        }
        let hash = fnv1a(text.as_bytes());
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        let mut first_tombstone: Option<usize> = None;
        loop {
            match &self.slots[idx] {
                Slot::Empty => {
                    let insert_at = first_tombstone.unwrap_or(idx);
                    let rc: Rc<str> = Rc::from(text);
                    let id = InternedId(self.by_id.len() as u32);
                    self.by_id.push(rc.clone());
                    if first_tombstone.is_some() {
                        self.tombstones -= 1;
                    }
                    self.slots[insert_at] = Slot::Occupied { hash, text: rc };
                    self.occupied += 1;
                    self.record_id(insert_at, id);
                    return id;
                }
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Occupied { hash: h, text: t } => {
                    if *h == hash && t.as_ref() == text {
                        return self.id_at(idx);
                    }
                }
            }
            idx = (idx + 1) & mask;
        }
    }

    pub fn resolve(&self, id: InternedId) -> &str {
        &self.by_id[id.0 as usize]
    }

    pub fn remove(&mut self, text: &str) {
        let hash = fnv1a(text.as_bytes());
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            match &self.slots[idx] {
                Slot::Empty => return,
                Slot::Occupied { hash: h, text: t } if *h == hash && t.as_ref() == text => {
                    self.slots[idx] = Slot::Tombstone;
                    self.occupied -= 1;
                    self.tombstones += 1;
                    return;
                }
                _ => idx = (idx + 1) & mask,
            }
        }
    }

    fn load_factor_exceeds_half(&self) -> bool {
        (self.occupied + self.tombstones) * 2 >= self.slots.len()
    }

    fn resize(&mut self) {
        let new_cap = (self.slots.len() * 2).max(16);
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_cap]);
        self.occupied = 0;
        self.tombstones = 0;
        // id_slot_map is rebuilt as part of rehash below.
        self.id_slot_map.clear();
        for slot in old {
            if let Slot::Occupied { hash, text } = slot {
                self.rehash_insert(hash, text);
            }
        }
    }

    fn rehash_insert(&mut self, hash: u64, text: Rc<str>) {
        let mask = self.slots.len() - 1;
        let mut idx = (hash as usize) & mask;
        loop {
            if matches!(self.slots[idx], Slot::Empty) {
                // Find the existing id for this text (already assigned in by_id).
                let id = self
                    .by_id
                    .iter()
                    .position(|t| Rc::ptr_eq(t, &text) || t.as_ref() == text.as_ref())
                    .expect("interned text must already have an id");
                self.slots[idx] = Slot::Occupied { hash, text };
                self.occupied += 1;
                self.record_id(idx, InternedId(id as u32));
                return;
            }
            idx = (idx + 1) & mask;
        }
    }

    fn record_id(&mut self, slot_idx: usize, id: InternedId) {
        if self.id_slot_map.len() <= slot_idx {
            self.id_slot_map.resize(self.slots.len(), u32::MAX);
        }
        self.id_slot_map[slot_idx] = id.0;
    }

    fn id_at(&self, slot_idx: usize) -> InternedId {
        InternedId(self.id_slot_map[slot_idx])
    }
}

impl Default for Interner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_same_text_twice_returns_same_id() {
        let mut i = Interner::new();
        let a = i.intern("foo");
        let b = i.intern("foo");
        assert_eq!(a, b);
    }

    #[test]
    fn interning_different_text_returns_different_id() {
        let mut i = Interner::new();
        let a = i.intern("foo");
        let b = i.intern("bar");
        assert_ne!(a, b);
    }

    #[test]
    fn resolve_round_trips() {
        let mut i = Interner::new();
        let id = i.intern("hello-world");
        assert_eq!(i.resolve(id), "hello-world");
    }

    #[test]
    fn survives_growth_past_half_load() {
        let mut i = Interner::new();
        let mut ids = Vec::new();
        for n in 0..200 {
            ids.push((n, i.intern(&format!("sym-{n}"))));
        }
        for (n, id) in ids {
            assert_eq!(i.resolve(id), format!("sym-{n}"));
        }
    }

    #[test]
    fn remove_then_reintern_is_consistent() {
        let mut i = Interner::new();
        let a = i.intern("transient");
        i.remove("transient");
        let b = i.intern("transient");
        assert_eq!(i.resolve(b), "transient");
        let _ = a;
    }
}
