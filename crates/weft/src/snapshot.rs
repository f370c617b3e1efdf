//! Snapshot encoding and decoding.
//!
//! A snapshot is a little-endian, length-prefixed byte sequence with fixed
//! section order: header (magic, version), the shared globals (variables,
//! visit records, turn counter, picked set, string and list tables), then
//! per-runner blobs. Loading reconstructs state that continues execution
//! exactly as the original would have; `snap → load → snap` is byte
//! identical. A snapshot loads only under the version that wrote it.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::globals::GlobalStore;
use crate::runner::{Runner, StackLimits};
use crate::story::Story;
use crate::value::{ListRef, ScopeHint, StrRef, Value};
use crate::wire::{Reader, Writer};

pub(crate) const SNAPSHOT_MAGIC: u32 = u32::from_le_bytes(*b"WSNP");
pub(crate) const SNAPSHOT_VERSION: u32 = 1;

pub(crate) fn create(runner: &Runner<'_>) -> Vec<u8> {
    let mut w = Writer::new();
    w.u32(SNAPSHOT_MAGIC);
    w.u32(SNAPSHOT_VERSION);
    runner.globals().borrow().snap(&mut w);
    w.u32(1); // runner blob count
    runner.snap(&mut w);
    w.into_bytes()
}

pub(crate) fn load<'s>(story: &'s Story, bytes: &[u8]) -> Result<Runner<'s>> {
    let mut r = Reader::new(bytes);
    if r.u32()? != SNAPSHOT_MAGIC {
        return Err(Error::SnapshotCorrupt("bad magic".into()));
    }
    let version = r.u32()?;
    if version != SNAPSHOT_VERSION {
        return Err(Error::SnapshotVersion {
            expected: SNAPSHOT_VERSION,
            got: version,
        });
    }

    let store = GlobalStore::snap_load(&mut r)?;
    let globals = Rc::new(RefCell::new(store));

    let runner_count = r.u32()?;
    if runner_count == 0 {
        return Err(Error::SnapshotCorrupt("no runner blobs".into()));
    }
    let mut runner = Runner::new(story, globals, StackLimits::default());
    runner.snap_load(&mut r)?;
    Ok(runner)
}

// ---------------------------------------------------------------------------
// Value cells
// ---------------------------------------------------------------------------

pub(crate) fn snap_value(w: &mut Writer, v: &Value) {
    match v {
        Value::None => w.u8(0),
        Value::Bool(b) => {
            w.u8(1);
            w.bool(*b);
        }
        Value::Int(i) => {
            w.u8(2);
            w.i32(*i);
        }
        Value::Float(f) => {
            w.u8(3);
            w.f32(*f);
        }
        Value::Uint(u) => {
            w.u8(4);
            w.u32(*u);
        }
        Value::Str(StrRef::Const(i)) => {
            w.u8(5);
            w.u32(*i);
        }
        Value::Str(StrRef::Heap(h)) => {
            w.u8(6);
            w.u32(*h);
        }
        Value::List(l) => {
            w.u8(7);
            w.u32(l.0);
        }
        Value::Divert(t) => {
            w.u8(8);
            w.u32(*t);
        }
        Value::DivertValue {
            target,
            record_visits,
        } => {
            w.u8(9);
            w.u32(*target);
            w.bool(*record_visits);
        }
        Value::VarPointer { name, hint } => {
            w.u8(10);
            w.u32(*name);
            w.u8(match hint {
                ScopeHint::None => 0,
                ScopeHint::Global => 1,
                ScopeHint::Local => 2,
            });
        }
        Value::Newline => w.u8(11),
        Value::Glue => w.u8(12),
        Value::FuncStart => w.u8(13),
        Value::FuncEnd => w.u8(14),
        Value::ThreadStart => w.u8(15),
        Value::TagStart => w.u8(16),
        Value::StrStart => w.u8(17),
    }
}

pub(crate) fn read_value(r: &mut Reader<'_>) -> Result<Value> {
    let v = match r.u8()? {
        0 => Value::None,
        1 => Value::Bool(r.bool()?),
        2 => Value::Int(r.i32()?),
        3 => Value::Float(r.f32()?),
        4 => Value::Uint(r.u32()?),
        5 => Value::Str(StrRef::Const(r.u32()?)),
        6 => Value::Str(StrRef::Heap(r.u32()?)),
        7 => Value::List(ListRef(r.u32()?)),
        8 => Value::Divert(r.u32()?),
        9 => Value::DivertValue {
            target: r.u32()?,
            record_visits: r.bool()?,
        },
        10 => Value::VarPointer {
            name: r.u32()?,
            hint: match r.u8()? {
                0 => ScopeHint::None,
                1 => ScopeHint::Global,
                2 => ScopeHint::Local,
                other => {
                    return Err(Error::SnapshotCorrupt(format!("bad scope hint {other}")));
                }
            },
        },
        11 => Value::Newline,
        12 => Value::Glue,
        13 => Value::FuncStart,
        14 => Value::FuncEnd,
        15 => Value::ThreadStart,
        16 => Value::TagStart,
        17 => Value::StrStart,
        other => {
            return Err(Error::SnapshotCorrupt(format!("bad value tag {other}")));
        }
    };
    Ok(v)
}
