//! State shared by every runner of a story.
//!
//! One [`GlobalStore`] holds the global variables, per-container visit
//! records, the turn counter, the once-only picked set, and the string/list
//! tables. Runners reference it through [`Globals`] — an `Rc<RefCell<_>>`,
//! because the engine is single-threaded and cooperative by design; writes
//! made during one runner's step are visible to every sharing runner as soon
//! as that step returns.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::error::Result;
use crate::lists::ListTable;
use crate::runner::Runner;
use crate::snapshot::{read_value, snap_value};
use crate::strings::StringTable;
use crate::value::{StrRef, Value};
use crate::wire::{Reader, Writer};

/// Shared handle to a [`GlobalStore`].
pub type Globals = Rc<RefCell<GlobalStore>>;

/// Visit bookkeeping for one container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisitRecord {
    pub visits: u32,
    /// Turn index of the most recent visit, or -1 if never visited.
    pub last_turn: i32,
}

#[derive(Debug, Clone, Default)]
struct SavedGlobals {
    vars: HashMap<u32, Value>,
    visits: HashMap<u32, VisitRecord>,
    turn: u32,
    picked: HashSet<u32>,
}

/// The mutable state shared across runners.
#[derive(Debug, Default)]
pub struct GlobalStore {
    vars: HashMap<u32, Value>,
    visits: HashMap<u32, VisitRecord>,
    /// Bumped once per `choose` on any sharing runner.
    turn: u32,
    /// Source paths of once-only choices that have been picked.
    picked: HashSet<u32>,
    pub(crate) strings: StringTable,
    pub(crate) lists: ListTable,
    saved: Option<Box<SavedGlobals>>,
}

impl GlobalStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // -- variables ----------------------------------------------------------

    pub fn get_var(&self, name: u32) -> Option<Value> {
        self.vars.get(&name).copied()
    }

    /// Create or overwrite a global variable.
    pub fn set_var(&mut self, name: u32, value: Value) {
        self.vars.insert(name, value);
    }

    /// Overwrite an existing global; false if the name is unknown.
    pub(crate) fn set_existing(&mut self, name: u32, value: Value) -> bool {
        match self.vars.get_mut(&name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    // -- visits and turns ---------------------------------------------------

    pub fn visit_count(&self, container: u32) -> u32 {
        self.visits.get(&container).map_or(0, |r| r.visits)
    }

    /// Turns elapsed since the container was last visited; -1 if never.
    pub fn turns_since(&self, container: u32) -> i32 {
        match self.visits.get(&container) {
            Some(r) if r.last_turn >= 0 => self.turn as i32 - r.last_turn,
            _ => -1,
        }
    }

    pub(crate) fn record_visit(&mut self, container: u32, record_turn: bool) {
        let record = self.visits.entry(container).or_insert(VisitRecord {
            visits: 0,
            last_turn: -1,
        });
        record.visits += 1;
        if record_turn {
            record.last_turn = self.turn as i32;
        }
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub(crate) fn next_turn(&mut self) {
        self.turn += 1;
    }

    // -- once-only choices --------------------------------------------------

    pub(crate) fn mark_picked(&mut self, path: u32) {
        self.picked.insert(path);
    }

    pub(crate) fn is_picked(&self, path: u32) -> bool {
        self.picked.contains(&path)
    }

    // -- speculation --------------------------------------------------------

    pub(crate) fn save(&mut self) {
        debug_assert!(self.saved.is_none(), "nested save");
        self.saved = Some(Box::new(SavedGlobals {
            vars: self.vars.clone(),
            visits: self.visits.clone(),
            turn: self.turn,
            picked: self.picked.clone(),
        }));
        self.strings.save();
        self.lists.save();
    }

    pub(crate) fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.vars = saved.vars;
            self.visits = saved.visits;
            self.turn = saved.turn;
            self.picked = saved.picked;
        }
        self.strings.restore();
        self.lists.restore();
    }

    pub(crate) fn forget(&mut self) {
        self.saved = None;
        self.strings.forget();
        self.lists.forget();
    }

    // -- garbage collection -------------------------------------------------

    pub(crate) fn mark_own(&self, marks: &mut Marks) {
        for value in self.vars.values() {
            marks.mark_value(value);
        }
    }

    pub(crate) fn sweep(&mut self, marks: &Marks) {
        self.strings.sweep(&marks.strings);
        self.lists.sweep(&marks.lists);
    }

    // -- snapshot -----------------------------------------------------------

    pub(crate) fn snap(&self, w: &mut Writer) {
        // Maps are written in sorted key order so identical state always
        // yields identical bytes.
        let mut vars: Vec<(&u32, &Value)> = self.vars.iter().collect();
        vars.sort_by_key(|(k, _)| **k);
        w.u32(vars.len() as u32);
        for (name, value) in vars {
            w.u32(*name);
            snap_value(w, value);
        }

        let mut visits: Vec<(&u32, &VisitRecord)> = self.visits.iter().collect();
        visits.sort_by_key(|(k, _)| **k);
        w.u32(visits.len() as u32);
        for (container, record) in visits {
            w.u32(*container);
            w.u32(record.visits);
            w.i32(record.last_turn);
        }

        w.u32(self.turn);

        let mut picked: Vec<&u32> = self.picked.iter().collect();
        picked.sort();
        w.u32(picked.len() as u32);
        for path in picked {
            w.u32(*path);
        }

        self.strings.snap(w);
        self.lists.snap(w);
    }

    pub(crate) fn snap_load(r: &mut Reader<'_>) -> Result<Self> {
        let mut vars = HashMap::new();
        for _ in 0..r.u32()? {
            let name = r.u32()?;
            vars.insert(name, read_value(r)?);
        }

        let mut visits = HashMap::new();
        for _ in 0..r.u32()? {
            let container = r.u32()?;
            let count = r.u32()?;
            let last_turn = r.i32()?;
            visits.insert(
                container,
                VisitRecord {
                    visits: count,
                    last_turn,
                },
            );
        }

        let turn = r.u32()?;

        let mut picked = HashSet::new();
        for _ in 0..r.u32()? {
            picked.insert(r.u32()?);
        }

        let strings = StringTable::snap_load(r)?;
        let lists = ListTable::snap_load(r)?;

        Ok(Self {
            vars,
            visits,
            turn,
            picked,
            strings,
            lists,
            saved: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Mark/sweep
// ---------------------------------------------------------------------------

/// Mark bits for one sweep over the string and list tables.
pub struct Marks {
    pub(crate) strings: Vec<bool>,
    pub(crate) lists: Vec<bool>,
}

impl Marks {
    pub(crate) fn for_store(store: &GlobalStore) -> Self {
        Self {
            strings: vec![false; store.strings.slot_count()],
            lists: vec![false; store.lists.slot_count()],
        }
    }

    pub(crate) fn mark_value(&mut self, v: &Value) {
        match v {
            Value::Str(StrRef::Heap(h)) => {
                if let Some(bit) = self.strings.get_mut(*h as usize) {
                    *bit = true;
                }
            }
            Value::List(l) => {
                if let Some(bit) = self.lists.get_mut(l.0 as usize) {
                    *bit = true;
                }
            }
            _ => {}
        }
    }
}

/// Run one mark/sweep pass over a globals object.
///
/// Every live runner sharing `globals` must be passed in: each one marks the
/// strings and lists reachable from its output stream, stacks, and choices,
/// then unmarked slots are reclaimed. Triggered by the embedder; the engine
/// never collects on its own.
pub fn gc(globals: &Globals, runners: &[&Runner<'_>]) {
    let mut store = globals.borrow_mut();
    let mut marks = Marks::for_store(&store);
    store.mark_own(&mut marks);
    for runner in runners {
        runner.mark_used(&mut marks);
    }
    store.sweep(&marks);
    tracing::debug!(
        target: "weft.gc",
        live_strings = store.strings.live_count(),
        "mark/sweep complete"
    );
}
