//! Runtime string storage.
//!
//! Heap strings — text assembled at run time by string evaluation, choice
//! capture, and external functions — are interned here and referenced by
//! handle from value cells. Reclamation is mark/sweep: the embedder asks
//! every live runner to mark the handles it can still reach, then sweeps.

use crate::wire::{Reader, Writer};
use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub(crate) struct StringTable {
    slots: Vec<Option<String>>,
    free: Vec<u32>,
    saved: Option<(Vec<Option<String>>, Vec<u32>)>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `text` and return a handle stable until the next sweep frees it.
    pub fn alloc(&mut self, text: String) -> u32 {
        match self.free.pop() {
            Some(handle) => {
                self.slots[handle as usize] = Some(text);
                handle
            }
            None => {
                self.slots.push(Some(text));
                (self.slots.len() - 1) as u32
            }
        }
    }

    /// Resolve a handle. A dangling handle resolves to the empty string; the
    /// sweep contract guarantees live handles are never dangling.
    pub fn get(&self, handle: u32) -> &str {
        self.slots
            .get(handle as usize)
            .and_then(|s| s.as_deref())
            .unwrap_or("")
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Free every slot whose handle is not marked.
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
                Some(text) => {
                    w.bool(true);
                    w.str(text);
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
                slots.push(Some(r.str()?));
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

    #[test]
    fn alloc_reuses_swept_slots() {
        let mut t = StringTable::new();
        let a = t.alloc("alpha".into());
        let b = t.alloc("beta".into());
        let mut marks = vec![false; t.slot_count()];
        marks[b as usize] = true;
        t.sweep(&marks);
        assert_eq!(t.get(a), "");
        assert_eq!(t.get(b), "beta");
        let c = t.alloc("gamma".into());
        assert_eq!(c, a);
        assert_eq!(t.get(c), "gamma");
    }

    #[test]
    fn restore_discards_speculative_allocs() {
        let mut t = StringTable::new();
        let a = t.alloc("kept".into());
        t.save();
        t.alloc("speculative".into());
        t.restore();
        assert_eq!(t.live_count(), 1);
        assert_eq!(t.get(a), "kept");
    }
}
