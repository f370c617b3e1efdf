//! Programmatic story assembly.
//!
//! [`StoryBuilder`] builds story images in memory: emit content and control
//! instructions, open and close containers, and connect forward jumps with
//! labels. The compiler that would normally produce images lives outside
//! this crate; the builder is how embedders and the test suite construct
//! them directly.
//!
//! # Example
//!
//! ```
//! use weft::{StoryBuilder, Op};
//!
//! let mut b = StoryBuilder::new();
//! b.line("Hello, World!");
//! b.emit(Op::End);
//! let story = b.story().unwrap();
//!
//! let globals = story.new_globals();
//! let mut runner = story.new_runner(&globals);
//! assert_eq!(runner.getline().unwrap(), "Hello, World!");
//! assert!(!runner.can_continue());
//! ```

use std::collections::HashMap;

use crate::bytecode::Op;
use crate::error::{Error, Result};
use crate::lists::{ListDef, ListSet};
use crate::story::{STORY_MAGIC, Story};
use crate::value::hash_name;
use crate::wire::Writer;

/// A forward-referenceable jump target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone)]
struct PendingContainer {
    name: u32,
    flags: u8,
    start: u32,
    end: Option<u32>,
}

/// Builds a story image instruction by instruction.
#[derive(Default)]
pub struct StoryBuilder {
    ops: Vec<Op>,
    consts: Vec<String>,
    const_index: HashMap<String, u32>,
    list_defs: Vec<ListDef>,
    list_literals: Vec<ListSet>,
    containers: Vec<PendingContainer>,
    open: Vec<usize>,
    labels: Vec<Option<u32>>,
    fixups: Vec<(usize, Label)>,
}

impl StoryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the next instruction to be emitted.
    pub fn here(&self) -> u32 {
        self.ops.len() as u32
    }

    /// Append a raw instruction.
    pub fn emit(&mut self, op: Op) -> &mut Self {
        self.ops.push(op);
        self
    }

    /// Intern a string constant, deduplicating identical text.
    pub fn string_const(&mut self, text: &str) -> u32 {
        if let Some(&idx) = self.const_index.get(text) {
            return idx;
        }
        let idx = self.consts.len() as u32;
        self.consts.push(text.to_string());
        self.const_index.insert(text.to_string(), idx);
        idx
    }

    /// Emit a text content instruction.
    pub fn text(&mut self, text: &str) -> &mut Self {
        let idx = self.string_const(text);
        self.emit(Op::Str(idx))
    }

    /// Emit a text content instruction followed by a newline.
    pub fn line(&mut self, text: &str) -> &mut Self {
        self.text(text).emit(Op::Newline)
    }

    pub fn newline(&mut self) -> &mut Self {
        self.emit(Op::Newline)
    }

    pub fn glue(&mut self) -> &mut Self {
        self.emit(Op::Glue)
    }

    // -- labels and jumps ---------------------------------------------------

    /// Create a label to be placed later with [`place`](Self::place).
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Pin `label` to the next instruction index.
    pub fn place(&mut self, label: Label) -> &mut Self {
        self.labels[label.0] = Some(self.here());
        self
    }

    fn fixup(&mut self, label: Label) {
        self.fixups.push((self.ops.len() - 1, label));
    }

    pub fn divert(&mut self, label: Label, record_visits: bool) -> &mut Self {
        self.emit(Op::Divert {
            target: u32::MAX,
            record_visits,
        });
        self.fixup(label);
        self
    }

    pub fn divert_if(&mut self, label: Label) -> &mut Self {
        self.emit(Op::DivertIf { target: u32::MAX });
        self.fixup(label);
        self
    }

    pub fn call(&mut self, label: Label) -> &mut Self {
        self.emit(Op::Call { target: u32::MAX });
        self.fixup(label);
        self
    }

    pub fn tunnel(&mut self, label: Label) -> &mut Self {
        self.emit(Op::Tunnel { target: u32::MAX });
        self.fixup(label);
        self
    }

    pub fn thread(&mut self, label: Label) -> &mut Self {
        self.emit(Op::Thread { target: u32::MAX });
        self.fixup(label);
        self
    }

    pub fn choice(&mut self, flags: u8, label: Label) -> &mut Self {
        self.emit(Op::Choice {
            flags,
            target: u32::MAX,
        });
        self.fixup(label);
        self
    }

    // -- containers ---------------------------------------------------------

    /// Open a named container. Emits its `Enter` marker and returns its id.
    pub fn begin_container(&mut self, name: &str, flags: u8) -> u32 {
        let id = self.containers.len() as u32;
        self.containers.push(PendingContainer {
            name: hash_name(name),
            flags,
            start: self.here(),
            end: None,
        });
        self.open.push(id as usize);
        self.emit(Op::Enter { id, flags });
        id
    }

    /// Open an anonymous container (no name hash).
    pub fn begin_anonymous(&mut self, flags: u8) -> u32 {
        let id = self.containers.len() as u32;
        self.containers.push(PendingContainer {
            name: 0,
            flags,
            start: self.here(),
            end: None,
        });
        self.open.push(id as usize);
        self.emit(Op::Enter { id, flags });
        id
    }

    /// Close the innermost open container. Emits its `Exit` marker.
    pub fn end_container(&mut self) -> &mut Self {
        let idx = self.open.pop().expect("end_container without a match");
        self.emit(Op::Exit { id: idx as u32 });
        self.containers[idx].end = Some(self.here());
        self
    }

    // -- lists --------------------------------------------------------------

    /// Declare a list definition; items get values 1..n in order.
    pub fn list_def(&mut self, name: &str, items: &[&str]) -> u32 {
        self.list_defs.push(ListDef {
            name: name.to_string(),
            items: items.iter().map(|s| s.to_string()).collect(),
        });
        (self.list_defs.len() - 1) as u32
    }

    /// Intern a list literal for [`Op::PushList`].
    pub fn list_literal(&mut self, entries: &[(u32, u32)]) -> u32 {
        let mut set: ListSet = entries.to_vec();
        set.sort_unstable();
        set.dedup();
        self.list_literals.push(set);
        (self.list_literals.len() - 1) as u32
    }

    // -- output -------------------------------------------------------------

    /// Encode the image. Fails if a label was never placed or a container
    /// never closed.
    pub fn build(&self) -> Result<Vec<u8>> {
        if !self.open.is_empty() {
            return Err(Error::BadImage("unclosed container".into()));
        }

        let mut ops = self.ops.clone();
        for (op_idx, label) in &self.fixups {
            let Some(target) = self.labels[label.0] else {
                return Err(Error::BadImage(format!("label {} never placed", label.0)));
            };
            match &mut ops[*op_idx] {
                Op::Divert { target: t, .. }
                | Op::DivertIf { target: t }
                | Op::Call { target: t }
                | Op::Tunnel { target: t }
                | Op::Thread { target: t }
                | Op::Choice { target: t, .. } => *t = target,
                other => {
                    return Err(Error::BadImage(format!(
                        "fixup on non-jump instruction {other:?}"
                    )));
                }
            }
        }

        let mut w = Writer::new();
        w.u32(STORY_MAGIC);
        w.u32(Story::FORMAT_VERSION);

        w.u32(self.consts.len() as u32);
        for c in &self.consts {
            w.str(c);
        }

        w.u32(self.list_defs.len() as u32);
        for def in &self.list_defs {
            w.str(&def.name);
            w.u32(def.items.len() as u32);
            for item in &def.items {
                w.str(item);
            }
        }

        w.u32(self.list_literals.len() as u32);
        for set in &self.list_literals {
            w.u32(set.len() as u32);
            for (def, value) in set {
                w.u32(*def);
                w.u32(*value);
            }
        }

        w.u32(self.containers.len() as u32);
        for c in &self.containers {
            w.u32(c.name);
            w.u32(c.start);
            w.u32(c.end.unwrap_or(self.ops.len() as u32));
            w.u8(c.flags);
        }

        w.u32(ops.len() as u32);
        for op in &ops {
            op.encode(&mut w);
        }

        Ok(w.into_bytes())
    }

    /// Encode and immediately decode, yielding a ready [`Story`].
    pub fn story(&self) -> Result<Story> {
        Story::from_bytes(&self.build()?)
    }
}
