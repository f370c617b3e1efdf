//! Bytecode instruction set.
//!
//! This module defines the instructions a compiled story image contains and
//! the runner executes, plus their wire encoding: one opcode byte followed by
//! little-endian operands. The runner interprets decoded instructions with a
//! `loop { match op { ... } }` dispatch.

use crate::error::{Error, Result};
use crate::value::ScopeHint;
use crate::wire::{Reader, Writer};

// ---------------------------------------------------------------------------
// Operator enums
// ---------------------------------------------------------------------------

/// Binary operators.
///
/// One operator set covers numbers, strings, and lists; the calculator in
/// [`crate::ops`] dispatches on operand type. `Add` is string concatenation
/// and list union, `Sub` is list difference, `Has`/`Hasnt` are substring and
/// subset tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
    Min,
    Max,
    Has,
    Hasnt,
    Intersect,
}

/// Unary operators. The list-prefixed variants operate on list sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Neg,
    Floor,
    Ceil,
    ToInt,
    ToFloat,
    ListCount,
    ListMin,
    ListMax,
    ListInvert,
    ListValue,
}

// ---------------------------------------------------------------------------
// Choice and container flags
// ---------------------------------------------------------------------------

/// The choice instruction pops a condition from the evaluation stack.
pub const CHOICE_HAS_CONDITION: u8 = 0x01;
/// The choice instruction pops a start-text string (shown and captured).
pub const CHOICE_HAS_START_TEXT: u8 = 0x02;
/// The choice instruction pops a choice-only string (shown, not captured).
pub const CHOICE_HAS_CHOICE_ONLY_TEXT: u8 = 0x04;
/// The choice is a fallback, followed only when no normal choice is offered.
pub const CHOICE_INVISIBLE_DEFAULT: u8 = 0x08;
/// The choice is filtered out after having been picked once.
pub const CHOICE_ONCE_ONLY: u8 = 0x10;

/// Entering the container increments its visit count.
pub const CONTAINER_RECORD_VISITS: u8 = 0x01;
/// Entering the container records the turn index of the visit.
pub const CONTAINER_RECORD_TURNS: u8 = 0x02;
/// The container generates choices (compiler metadata; unused at run time).
pub const CONTAINER_HAS_CHOICES: u8 = 0x04;

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

/// A single decoded instruction.
///
/// `target` operands are instruction indices into the story's flat
/// instruction array; `name` operands are 32-bit name hashes; string and
/// list operands index the story's constant pools.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    /// No operation.
    Nop,

    // --- Content ---
    /// Emit `constants[i]`: onto the evaluation stack in evaluation mode,
    /// into the output stream otherwise.
    Str(u32),

    /// Append a newline marker to the output stream (deduplicated there).
    Newline,

    /// Append a glue marker: adjacent whitespace and newlines are absorbed.
    Glue,

    // --- Control flow ---
    /// Unconditional jump. `record_visits` controls whether containers
    /// entered by this jump count the visit.
    Divert { target: u32, record_visits: bool },

    /// Pop the evaluation stack; jump if the value is truthy.
    DivertIf { target: u32 },

    /// Call a function container: push a function frame, jump to `target`.
    Call { target: u32 },

    /// Call a tunnel: like a function, but returns no value.
    Tunnel { target: u32 },

    /// Fork a cooperative thread at `target`; the parent resumes at the
    /// following instruction once the thread is done.
    Thread { target: u32 },

    /// Return from the innermost function frame.
    Ret,

    /// Return from the innermost tunnel frame.
    TunnelRet,

    /// Suspend the current flow. Inside a thread this resumes the parent;
    /// at top level it halts the runner (presenting any collected choices).
    Done,

    /// Terminate the story outright, discarding pending choices.
    End,

    // --- Literals ---
    PushInt(i32),
    PushFloat(f32),
    PushBool(bool),
    /// Push a divert target as a value.
    PushDivert(u32),
    /// Instantiate list literal `i` from the story image and push it.
    PushList(u32),
    PushNone,

    // --- Operators ---
    /// Pop right then left, apply, push the result.
    Binary(BinOp),

    /// Pop one value, apply, push the result.
    Unary(UnOp),

    /// Pop max, min, then a list; push the entries whose values are in range.
    ListRange,

    // --- Output control ---
    /// Enter evaluation mode: content instructions push values instead of
    /// writing output.
    BeginEval,
    EndEval,

    /// Pop the evaluation stack and append the value to the output stream.
    Out,

    /// Discard the top of the evaluation stack.
    Pop,

    /// Duplicate the top of the evaluation stack.
    Dup,

    /// Begin capturing output into a string; `EndStr` pushes the captured
    /// text onto the evaluation stack.
    BeginStr,
    EndStr,

    /// Begin capturing output into a tag; `EndTag` files the captured text
    /// at the appropriate tag level.
    BeginTag,
    EndTag,

    // --- Variables ---
    /// Push the value of a variable, searching per the scope hint.
    GetVar { name: u32, hint: ScopeHint },

    /// Pop and store into an existing variable. With `redef` the variable is
    /// created as a global if it does not exist; without it, a missing name
    /// is a fatal error.
    SetVar { name: u32, redef: bool },

    /// Pop and bind a fresh local variable in the current frame scope.
    DefLocal { name: u32 },

    /// Push a by-name pointer to a variable.
    PushVarRef { name: u32 },

    /// Pop a variable pointer and push the value it refers to.
    Deref,

    // --- Choices ---
    /// Assemble a choice from the evaluation stack per `flags` and add it to
    /// the choice list (or the fallback slot for invisible defaults).
    Choice { flags: u8, target: u32 },

    // --- Containers ---
    /// Mark the start of container `id`, recording visits per `flags`.
    Enter { id: u32, flags: u8 },

    /// Mark the end of container `id`.
    Exit { id: u32 },

    // --- Counters ---
    /// Push the visit count of the innermost container.
    Visits,

    /// Push the visit count of the named container.
    ReadCount { container: u32 },

    /// Pop a divert target; push the number of turns since that container
    /// was last visited, or -1 if never.
    TurnsSince,

    /// Push a shuffled sequence index in `0..count`, stable per visit count
    /// of the innermost container. `seed` keeps distinct sequences from
    /// sharing a shuffle order.
    Seq { count: u32, seed: u32 },

    /// Pop max then min; push a uniform random integer in `min..=max`.
    Random,

    // --- Externals ---
    /// Pop `args` values and invoke the bound external function; push its
    /// result.
    CallExternal { name: u32, args: u8 },
}

impl Op {
    pub(crate) fn encode(&self, w: &mut Writer) {
        match *self {
            Op::Nop => w.u8(0x00),
            Op::Str(i) => {
                w.u8(0x01);
                w.u32(i);
            }
            Op::Newline => w.u8(0x02),
            Op::Glue => w.u8(0x03),
            Op::Divert {
                target,
                record_visits,
            } => {
                w.u8(0x04);
                w.u32(target);
                w.bool(record_visits);
            }
            Op::DivertIf { target } => {
                w.u8(0x05);
                w.u32(target);
            }
            Op::Call { target } => {
                w.u8(0x06);
                w.u32(target);
            }
            Op::Tunnel { target } => {
                w.u8(0x07);
                w.u32(target);
            }
            Op::Thread { target } => {
                w.u8(0x08);
                w.u32(target);
            }
            Op::Ret => w.u8(0x09),
            Op::TunnelRet => w.u8(0x0a),
            Op::Done => w.u8(0x0b),
            Op::End => w.u8(0x0c),
            Op::PushInt(v) => {
                w.u8(0x0d);
                w.i32(v);
            }
            Op::PushFloat(v) => {
                w.u8(0x0e);
                w.f32(v);
            }
            Op::PushBool(v) => {
                w.u8(0x0f);
                w.bool(v);
            }
            Op::PushDivert(t) => {
                w.u8(0x10);
                w.u32(t);
            }
            Op::PushList(i) => {
                w.u8(0x11);
                w.u32(i);
            }
            Op::PushNone => w.u8(0x12),
            Op::Binary(op) => {
                w.u8(0x13);
                w.u8(op as u8);
            }
            Op::Unary(op) => {
                w.u8(0x14);
                w.u8(op as u8);
            }
            Op::ListRange => w.u8(0x15),
            Op::BeginEval => w.u8(0x16),
            Op::EndEval => w.u8(0x17),
            Op::Out => w.u8(0x18),
            Op::Pop => w.u8(0x19),
            Op::Dup => w.u8(0x1a),
            Op::BeginStr => w.u8(0x1b),
            Op::EndStr => w.u8(0x1c),
            Op::BeginTag => w.u8(0x1d),
            Op::EndTag => w.u8(0x1e),
            Op::GetVar { name, hint } => {
                w.u8(0x1f);
                w.u32(name);
                w.u8(encode_hint(hint));
            }
            Op::SetVar { name, redef } => {
                w.u8(0x20);
                w.u32(name);
                w.bool(redef);
            }
            Op::DefLocal { name } => {
                w.u8(0x21);
                w.u32(name);
            }
            Op::PushVarRef { name } => {
                w.u8(0x22);
                w.u32(name);
            }
            Op::Deref => w.u8(0x23),
            Op::Choice { flags, target } => {
                w.u8(0x24);
                w.u8(flags);
                w.u32(target);
            }
            Op::Enter { id, flags } => {
                w.u8(0x25);
                w.u32(id);
                w.u8(flags);
            }
            Op::Exit { id } => {
                w.u8(0x26);
                w.u32(id);
            }
            Op::Visits => w.u8(0x27),
            Op::ReadCount { container } => {
                w.u8(0x28);
                w.u32(container);
            }
            Op::TurnsSince => w.u8(0x29),
            Op::Seq { count, seed } => {
                w.u8(0x2a);
                w.u32(count);
                w.u32(seed);
            }
            Op::Random => w.u8(0x2b),
            Op::CallExternal { name, args } => {
                w.u8(0x2c);
                w.u32(name);
                w.u8(args);
            }
        }
    }

    pub(crate) fn decode(r: &mut Reader<'_>, offset: u32) -> Result<Op> {
        let opcode = r.u8()?;
        let op = match opcode {
            0x00 => Op::Nop,
            0x01 => Op::Str(r.u32()?),
            0x02 => Op::Newline,
            0x03 => Op::Glue,
            0x04 => Op::Divert {
                target: r.u32()?,
                record_visits: r.bool()?,
            },
            0x05 => Op::DivertIf { target: r.u32()? },
            0x06 => Op::Call { target: r.u32()? },
            0x07 => Op::Tunnel { target: r.u32()? },
            0x08 => Op::Thread { target: r.u32()? },
            0x09 => Op::Ret,
            0x0a => Op::TunnelRet,
            0x0b => Op::Done,
            0x0c => Op::End,
            0x0d => Op::PushInt(r.i32()?),
            0x0e => Op::PushFloat(r.f32()?),
            0x0f => Op::PushBool(r.bool()?),
            0x10 => Op::PushDivert(r.u32()?),
            0x11 => Op::PushList(r.u32()?),
            0x12 => Op::PushNone,
            0x13 => Op::Binary(decode_binop(r.u8()?, offset)?),
            0x14 => Op::Unary(decode_unop(r.u8()?, offset)?),
            0x15 => Op::ListRange,
            0x16 => Op::BeginEval,
            0x17 => Op::EndEval,
            0x18 => Op::Out,
            0x19 => Op::Pop,
            0x1a => Op::Dup,
            0x1b => Op::BeginStr,
            0x1c => Op::EndStr,
            0x1d => Op::BeginTag,
            0x1e => Op::EndTag,
            0x1f => Op::GetVar {
                name: r.u32()?,
                hint: decode_hint(r.u8()?, offset)?,
            },
            0x20 => Op::SetVar {
                name: r.u32()?,
                redef: r.bool()?,
            },
            0x21 => Op::DefLocal { name: r.u32()? },
            0x22 => Op::PushVarRef { name: r.u32()? },
            0x23 => Op::Deref,
            0x24 => Op::Choice {
                flags: r.u8()?,
                target: r.u32()?,
            },
            0x25 => Op::Enter {
                id: r.u32()?,
                flags: r.u8()?,
            },
            0x26 => Op::Exit { id: r.u32()? },
            0x27 => Op::Visits,
            0x28 => Op::ReadCount { container: r.u32()? },
            0x29 => Op::TurnsSince,
            0x2a => Op::Seq {
                count: r.u32()?,
                seed: r.u32()?,
            },
            0x2b => Op::Random,
            0x2c => Op::CallExternal {
                name: r.u32()?,
                args: r.u8()?,
            },
            _ => return Err(Error::InvalidInstruction(offset)),
        };
        Ok(op)
    }
}

fn encode_hint(hint: ScopeHint) -> u8 {
    match hint {
        ScopeHint::None => 0,
        ScopeHint::Global => 1,
        ScopeHint::Local => 2,
    }
}

fn decode_hint(byte: u8, offset: u32) -> Result<ScopeHint> {
    match byte {
        0 => Ok(ScopeHint::None),
        1 => Ok(ScopeHint::Global),
        2 => Ok(ScopeHint::Local),
        _ => Err(Error::InvalidInstruction(offset)),
    }
}

fn decode_binop(byte: u8, offset: u32) -> Result<BinOp> {
    use BinOp::*;
    const TABLE: [BinOp; 19] = [
        Add, Sub, Mul, Div, Mod, Pow, Eq, Ne, Lt, Gt, Le, Ge, And, Or, Min, Max, Has, Hasnt,
        Intersect,
    ];
    TABLE
        .get(byte as usize)
        .copied()
        .ok_or(Error::InvalidInstruction(offset))
}

fn decode_unop(byte: u8, offset: u32) -> Result<UnOp> {
    use UnOp::*;
    const TABLE: [UnOp; 11] = [
        Not, Neg, Floor, Ceil, ToInt, ToFloat, ListCount, ListMin, ListMax, ListInvert, ListValue,
    ];
    TABLE
        .get(byte as usize)
        .copied()
        .ok_or(Error::InvalidInstruction(offset))
}
