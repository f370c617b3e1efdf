//! The compiled story image.
//!
//! A story is the read-only product of compilation: a flat instruction
//! array, the container index, string constants, and list definitions. All
//! runners created from one story share it by reference; nothing here is
//! mutated after loading.
//!
//! Physical format (little-endian, length-prefixed sections): magic,
//! format version, string constants, list definitions, list literals,
//! container index, instruction stream.

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use crate::bytecode::Op;
use crate::error::{Error, Result};
use crate::globals::{GlobalStore, Globals};
use crate::lists::{ListDef, ListSet};
use crate::runner::{Runner, StackLimits};
use crate::wire::Reader;

pub(crate) const STORY_MAGIC: u32 = u32::from_le_bytes(*b"WEFT");

/// An entry in the container index.
///
/// Containers are the addressable sections of a story (knots, stitches,
/// choice bodies). `start` is the instruction index of the container's
/// `Enter` marker and `end` the index one past its `Exit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDef {
    pub id: u32,
    /// Name hash, or 0 for anonymous containers.
    pub name: u32,
    pub start: u32,
    pub end: u32,
    pub flags: u8,
}

/// A loaded, immutable story image.
#[derive(Debug, Clone)]
pub struct Story {
    pub(crate) ops: Vec<Op>,
    pub(crate) consts: Vec<String>,
    pub(crate) list_defs: Vec<ListDef>,
    pub(crate) list_literals: Vec<ListSet>,
    pub(crate) containers: Vec<ContainerDef>,
}

impl Story {
    /// The story image format version this build reads and writes.
    pub const FORMAT_VERSION: u32 = 1;

    /// Decode a story image from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);

        if r.u32()? != STORY_MAGIC {
            return Err(Error::BadImage("bad magic".into()));
        }
        let version = r.u32()?;
        if version != Self::FORMAT_VERSION {
            return Err(Error::BadImage(format!(
                "format version {version} is not the supported version {}",
                Self::FORMAT_VERSION
            )));
        }

        let const_count = r.u32()? as usize;
        let mut consts = Vec::with_capacity(const_count);
        for _ in 0..const_count {
            consts.push(r.str()?);
        }

        let def_count = r.u32()? as usize;
        let mut list_defs = Vec::with_capacity(def_count);
        for _ in 0..def_count {
            let name = r.str()?;
            let item_count = r.u32()? as usize;
            let mut items = Vec::with_capacity(item_count);
            for _ in 0..item_count {
                items.push(r.str()?);
            }
            list_defs.push(ListDef { name, items });
        }

        let literal_count = r.u32()? as usize;
        let mut list_literals = Vec::with_capacity(literal_count);
        for _ in 0..literal_count {
            let len = r.u32()? as usize;
            let mut set = Vec::with_capacity(len);
            for _ in 0..len {
                let def = r.u32()?;
                let value = r.u32()?;
                set.push((def, value));
            }
            list_literals.push(set);
        }

        let container_count = r.u32()? as usize;
        let mut containers = Vec::with_capacity(container_count);
        for id in 0..container_count {
            let name = r.u32()?;
            let start = r.u32()?;
            let end = r.u32()?;
            let flags = r.u8()?;
            containers.push(ContainerDef {
                id: id as u32,
                name,
                start,
                end,
                flags,
            });
        }

        let op_count = r.u32()? as usize;
        let mut ops = Vec::with_capacity(op_count);
        for i in 0..op_count {
            ops.push(Op::decode(&mut r, i as u32)?);
        }

        let story = Self {
            ops,
            consts,
            list_defs,
            list_literals,
            containers,
        };
        story.validate()?;
        Ok(story)
    }

    /// Load a story image from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Check that every jump target and pool index stays inside the image.
    fn validate(&self) -> Result<()> {
        let n = self.ops.len() as u32;
        for (i, op) in self.ops.iter().enumerate() {
            let target = match *op {
                Op::Divert { target, .. }
                | Op::DivertIf { target }
                | Op::Call { target }
                | Op::Tunnel { target }
                | Op::Thread { target }
                | Op::Choice { target, .. }
                | Op::PushDivert(target) => Some(target),
                Op::Str(c) => {
                    if c as usize >= self.consts.len() {
                        return Err(Error::BadImage(format!("string constant {c} out of range")));
                    }
                    None
                }
                Op::PushList(l) => {
                    if l as usize >= self.list_literals.len() {
                        return Err(Error::BadImage(format!("list literal {l} out of range")));
                    }
                    None
                }
                _ => None,
            };
            if let Some(target) = target
                && target >= n
            {
                return Err(Error::BadImage(format!(
                    "instruction {i} jumps to {target}, past the end of the image"
                )));
            }
        }
        for c in &self.containers {
            if c.start > c.end || c.end > n {
                return Err(Error::BadImage(format!(
                    "container {} has range {}..{} outside the image",
                    c.id, c.start, c.end
                )));
            }
        }
        Ok(())
    }

    /// Create a fresh globals object for this story.
    pub fn new_globals(&self) -> Globals {
        Rc::new(RefCell::new(GlobalStore::new()))
    }

    /// Create a runner at the start of the story, sharing `globals`.
    pub fn new_runner<'s>(&'s self, globals: &Globals) -> Runner<'s> {
        Runner::new(self, globals.clone(), StackLimits::default())
    }

    /// Create a runner with fixed stack capacities.
    pub fn new_runner_with_limits<'s>(&'s self, globals: &Globals, limits: StackLimits) -> Runner<'s> {
        Runner::new(self, globals.clone(), limits)
    }

    /// Reconstruct a runner (and a fresh globals object) from a snapshot
    /// previously produced by [`Runner::create_snapshot`].
    pub fn load_snapshot<'s>(&'s self, bytes: &[u8]) -> Result<Runner<'s>> {
        crate::snapshot::load(self, bytes)
    }

    pub fn num_instructions(&self) -> usize {
        self.ops.len()
    }

    /// Look up a container by name hash.
    pub fn find_container(&self, name: u32) -> Option<&ContainerDef> {
        self.containers.iter().find(|c| c.name == name && name != 0)
    }

    pub(crate) fn container(&self, id: u32) -> Option<&ContainerDef> {
        self.containers.get(id as usize)
    }

    pub(crate) fn op_at(&self, ip: u32) -> Result<Op> {
        self.ops
            .get(ip as usize)
            .copied()
            .ok_or(Error::InvalidInstruction(ip))
    }

    /// Container whose `Enter` marker sits exactly at `ip`, if any.
    pub(crate) fn container_starting_at(&self, ip: u32) -> Option<&ContainerDef> {
        self.containers.iter().find(|c| c.start == ip)
    }

    /// Ids of the containers strictly enclosing `ip`, outermost first.
    ///
    /// A container whose `Enter` marker sits at `ip` is not yet entered: the
    /// marker has not executed.
    pub(crate) fn containers_enclosing(&self, ip: u32) -> Vec<u32> {
        let mut enclosing: Vec<&ContainerDef> = self
            .containers
            .iter()
            .filter(|c| c.start < ip && ip < c.end)
            .collect();
        // Outer containers open earlier.
        enclosing.sort_by_key(|c| c.start);
        enclosing.iter().map(|c| c.id).collect()
    }
}
