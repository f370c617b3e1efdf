//! List definitions and runtime list sets.
//!
//! A story declares named list definitions, each an ordered collection of
//! named items whose numeric values default to 1..n. A runtime list value is
//! a set of `(definition, item value)` pairs stored in the list table and
//! referenced by handle, with the same mark/sweep lifetime as heap strings.

use crate::wire::{Reader, Writer};
use crate::error::Result;

/// A named list definition from the story image.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ListDef {
    pub name: String,
    /// Item names in declaration order; item `i` has numeric value `i + 1`.
    pub items: Vec<String>,
}

impl ListDef {
    /// Name of the item with the given numeric value, if in range.
    pub fn item_name(&self, value: u32) -> Option<&str> {
        if value == 0 {
            return None;
        }
        self.items.get(value as usize - 1).map(String::as_str)
    }
}

/// A set of `(definition index, item value)` pairs, kept sorted and deduped.
pub(crate) type ListSet = Vec<(u32, u32)>;

fn normalize(mut set: ListSet) -> ListSet {
    set.sort_unstable();
    set.dedup();
    set
}

pub(crate) fn union(a: &ListSet, b: &ListSet) -> ListSet {
    let mut out = a.clone();
    out.extend_from_slice(b);
    normalize(out)
}

pub(crate) fn difference(a: &ListSet, b: &ListSet) -> ListSet {
    a.iter().filter(|e| !b.contains(e)).copied().collect()
}

pub(crate) fn intersect(a: &ListSet, b: &ListSet) -> ListSet {
    a.iter().filter(|e| b.contains(e)).copied().collect()
}

/// True when every entry of `b` is present in `a`. The empty set is a subset
/// of everything.
pub(crate) fn contains_all(a: &ListSet, b: &ListSet) -> bool {
    b.iter().all(|e| a.contains(e))
}

/// All items of the definitions present in `set` that are not in `set`.
pub(crate) fn invert(set: &ListSet, defs: &[ListDef]) -> ListSet {
    let mut out = Vec::new();
    let mut seen_defs: Vec<u32> = set.iter().map(|(d, _)| *d).collect();
    seen_defs.sort_unstable();
    seen_defs.dedup();
    for def in seen_defs {
        let Some(d) = defs.get(def as usize) else {
            continue;
        };
        for value in 1..=d.items.len() as u32 {
            if !set.contains(&(def, value)) {
                out.push((def, value));
            }
        }
    }
    out
}

/// Entries whose numeric value lies in `min..=max`.
pub(crate) fn range(set: &ListSet, min: i32, max: i32) -> ListSet {
    set.iter()
        .filter(|(_, v)| (*v as i32) >= min && (*v as i32) <= max)
        .copied()
        .collect()
}

/// Shift every item value by `delta`, dropping items that fall outside their
/// definition.
pub(crate) fn shift(set: &ListSet, delta: i32, defs: &[ListDef]) -> ListSet {
    let mut out = Vec::new();
    for (def, value) in set {
        let shifted = *value as i32 + delta;
        let len = defs.get(*def as usize).map_or(0, |d| d.items.len() as i32);
        if shifted >= 1 && shifted <= len {
            out.push((*def, shifted as u32));
        }
    }
    normalize(out)
}

pub(crate) fn min_entry(set: &ListSet) -> Option<(u32, u32)> {
    set.iter().copied().min_by_key(|(d, v)| (*v, *d))
}

pub(crate) fn max_entry(set: &ListSet) -> Option<(u32, u32)> {
    set.iter().copied().max_by_key(|(d, v)| (*v, *d))
}

/// Item names in ascending value order, comma separated.
pub(crate) fn render(set: &ListSet, defs: &[ListDef]) -> String {
    let mut entries: Vec<(u32, u32)> = set.clone();
    entries.sort_unstable_by_key(|(d, v)| (*v, *d));
    let names: Vec<&str> = entries
        .iter()
        .filter_map(|(d, v)| defs.get(*d as usize).and_then(|def| def.item_name(*v)))
        .collect();
    names.join(", ")
}

// ---------------------------------------------------------------------------
// List table
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub(crate) struct ListTable {
    slots: Vec<Option<ListSet>>,
    free: Vec<u32>,
    saved: Option<(Vec<Option<ListSet>>, Vec<u32>)>,
}

impl ListTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, set: ListSet) -> u32 {
        match self.free.pop() {
            Some(handle) => {
                self.slots[handle as usize] = Some(set);
                handle
            }
            None => {
                self.slots.push(Some(set));
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Resolve a handle; dangling handles resolve to the empty set.
    pub fn get(&self, handle: u32) -> &[(u32, u32)] {
        self.slots
            .get(handle as usize)
            .and_then(|s| s.as_deref())
            .unwrap_or(&[])
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn sweep(&mut self, marks: &[bool]) {
        debug_assert!(self.saved.is_none(), "sweep during speculation");
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_some() && !marks.get(i).copied().unwrap_or(false) {
                *slot = None;
                self.free.push(i as u32);
            }
        }
    }

    // -- speculation --------------------------------------------------------

    pub fn save(&mut self) {
        debug_assert!(self.saved.is_none(), "nested save");
        self.saved = Some((self.slots.clone(), self.free.clone()));
    }

    pub fn restore(&mut self) {
        if let Some((slots, free)) = self.saved.take() {
            self.slots = slots;
            self.free = free;
        }
    }

    pub fn forget(&mut self) {
        self.saved = None;
    }

    // -- snapshot -----------------------------------------------------------

    pub fn snap(&self, w: &mut Writer) {
        w.u32(self.slots.len() as u32);
        for slot in &self.slots {
            match slot {
                Some(set) => {
                    w.bool(true);
                    w.u32(set.len() as u32);
                    for (def, value) in set {
                        w.u32(*def);
                        w.u32(*value);
                    }
                }
                None => w.bool(false),
            }
        }
    }

    pub fn snap_load(r: &mut Reader<'_>) -> Result<Self> {
        let count = r.u32()? as usize;
        let mut slots = Vec::with_capacity(count);
        let mut free = Vec::new();
        for i in 0..count {
            if r.bool()? {
                let len = r.u32()? as usize;
                let mut set = Vec::with_capacity(len);
                for _ in 0..len {
                    let def = r.u32()?;
                    let value = r.u32()?;
                    set.push((def, value));
                }
                slots.push(Some(set));
            } else {
                slots.push(None);
                free.push(i as u32);
            }
        }
        Ok(Self {
            slots,
            free,
            saved: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn defs() -> Vec<ListDef> {
        vec![ListDef {
            name: "colors".into(),
            items: vec!["red".into(), "green".into(), "blue".into()],
        }]
    }

    #[test]
    fn set_algebra() {
        let a = vec![(0, 1), (0, 2)];
        let b = vec![(0, 2), (0, 3)];
        assert_eq!(union(&a, &b), vec![(0, 1), (0, 2), (0, 3)]);
        assert_eq!(difference(&a, &b), vec![(0, 1)]);
        assert_eq!(intersect(&a, &b), vec![(0, 2)]);
        assert!(contains_all(&a, &vec![(0, 1)]));
        assert!(!contains_all(&a, &b));
    }

    #[test]
    fn invert_fills_in_the_missing_items() {
        let set = vec![(0, 2)];
        assert_eq!(invert(&set, &defs()), vec![(0, 1), (0, 3)]);
    }

    #[test]
    fn shift_drops_out_of_range_items() {
        let set = vec![(0, 2), (0, 3)];
        assert_eq!(shift(&set, 1, &defs()), vec![(0, 3)]);
        assert_eq!(shift(&set, -1, &defs()), vec![(0, 1), (0, 2)]);
    }

    #[test]
    fn render_orders_by_value() {
        let set = vec![(0, 3), (0, 1)];
        assert_eq!(render(&set, &defs()), "red, blue");
    }
}
