//! The runner: a single execution of a story.
//!
//! A runner owns an instruction pointer, the runtime and evaluation stacks,
//! the output stream, and the choice/tag lists. [`Runner::getline`] drives
//! the fetch-dispatch loop until a full line of text is committed; line
//! boundaries are found by speculating past each newline with a coordinated
//! `save` across every mutable container and deciding afterwards whether
//! glue cancelled the newline, text extended the line, or the line stands.
//!
//! The runner is the only module that mutates runtime state; the calculator
//! in [`crate::ops`] and the stream in [`crate::output`] are helpers it
//! drives.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::bytecode::{
    CHOICE_HAS_CHOICE_ONLY_TEXT, CHOICE_HAS_CONDITION, CHOICE_HAS_START_TEXT,
    CHOICE_INVISIBLE_DEFAULT, CHOICE_ONCE_ONLY, CONTAINER_RECORD_TURNS, CONTAINER_RECORD_VISITS,
    Op,
};
use crate::error::{Error, Result};
use crate::globals::{GlobalStore, Globals, Marks};
use crate::ops::{self, OpEnv};
use crate::output::{OutputStream, RenderCtx};
use crate::restorable::Restorable;
use crate::rng::Prng;
use crate::snapshot::{self, read_value, snap_value};
use crate::story::Story;
use crate::value::{FrameKind, ListRef, ScopeHint, StrRef, Value, ValueKind};
use crate::wire::{Reader, Writer};

// ---------------------------------------------------------------------------
// Public data types
// ---------------------------------------------------------------------------

/// Fixed capacities for a runner's containers.
///
/// `None` means the container grows dynamically; `Some(n)` is a hard cap
/// whose overflow is a fatal error that kills the runner.
#[derive(Debug, Clone, Copy, Default)]
pub struct StackLimits {
    pub output: Option<usize>,
    pub runtime: Option<usize>,
    pub eval: Option<usize>,
    pub choices: Option<usize>,
}

/// A choice currently presented to the user.
#[derive(Debug, Clone)]
pub struct Choice {
    index: usize,
    text: String,
    captured: String,
    path: u32,
    once_only: bool,
    thread: Option<u32>,
}

impl Choice {
    /// Index to pass to [`Runner::choose`].
    pub fn index(&self) -> usize {
        self.index
    }

    /// Text to display to the user.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Id of the thread the choice was collected from, if any.
    pub fn thread(&self) -> Option<u32> {
        self.thread
    }

    fn snap(&self, w: &mut Writer) {
        w.u32(self.index as u32);
        w.str(&self.text);
        w.str(&self.captured);
        w.u32(self.path);
        w.bool(self.once_only);
        match self.thread {
            Some(t) => {
                w.bool(true);
                w.u32(t);
            }
            None => w.bool(false),
        }
    }

    fn snap_load(r: &mut Reader<'_>) -> Result<Self> {
        Ok(Self {
            index: r.u32()? as usize,
            text: r.str()?,
            captured: r.str()?,
            path: r.u32()?,
            once_only: r.bool()?,
            thread: if r.bool()? { Some(r.u32()?) } else { None },
        })
    }
}

/// How long a collected tag stays live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagLevel {
    /// Tags emitted before any visible text; never cleared.
    Global,
    /// Tags attached to the pending choice list; cleared on `choose`.
    Choice,
    /// Tags attached to the current line; cleared on `getline`.
    Line,
}

#[derive(Debug, Clone)]
struct Tag {
    text: String,
    level: TagLevel,
}

/// Owned values crossing the external-function boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtValue {
    None,
    Bool(bool),
    Int(i32),
    Float(f32),
    Str(String),
}

type ExtFn = Box<dyn FnMut(&[ExtValue]) -> ExtValue>;

struct Binding {
    func: ExtFn,
    lookahead_safe: bool,
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("lookahead_safe", &self.lookahead_safe)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Runtime stack entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: FrameKind,
    return_ip: u32,
    eval_mode: bool,
    string_mode: bool,
    /// Thread id for thread frames.
    thread: Option<u32>,
}

#[derive(Debug, Clone, Copy)]
enum StackEntry {
    Var { name: u32, value: Value },
    Frame(Frame),
}

/// Scalar state captured by a runner-wide save.
#[derive(Debug, Clone)]
struct SavedScalars {
    ip: Option<u32>,
    eval_mode: bool,
    string_mode: bool,
    tag_mode: bool,
    next_thread: u32,
    fallback: Option<Choice>,
    rng_state: u32,
    seen_text: bool,
    pending_record: Option<bool>,
}

/// Outcome of comparing the output stream against its save point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    NoChange,
    ExtendedPastNewline,
    NewlineRemoved,
}

fn make_ctx<'a>(story: &'a Story, store: &'a GlobalStore) -> RenderCtx<'a> {
    RenderCtx {
        consts: &story.consts,
        strings: &store.strings,
        lists: &store.lists,
        list_defs: &story.list_defs,
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Runner<'story> {
    story: &'story Story,
    globals: Globals,

    // == State ==
    ip: Option<u32>,
    output: OutputStream,
    stack: Restorable<StackEntry>,
    eval: Restorable<Value>,
    choices: Restorable<Choice>,
    fallback: Option<Choice>,
    tags: Restorable<Tag>,
    threads: Restorable<u32>,
    containers: Restorable<u32>,
    next_thread: u32,

    eval_mode: bool,
    string_mode: bool,
    tag_mode: bool,
    /// Visit-recording override for containers entered by the last jump.
    pending_record: Option<bool>,
    /// Whether any visible text has ever been committed (tags before that
    /// are global).
    seen_text: bool,

    rng: Prng,
    bindings: HashMap<u32, Binding>,

    saved: Option<SavedScalars>,
    abort_speculation: bool,
    dead: bool,
}

impl<'story> Runner<'story> {
    pub(crate) fn new(story: &'story Story, globals: Globals, limits: StackLimits) -> Self {
        Self {
            story,
            globals,
            ip: if story.ops.is_empty() { None } else { Some(0) },
            output: OutputStream::new(limits.output),
            stack: Restorable::with_capacity("runtime stack", limits.runtime),
            eval: Restorable::with_capacity("evaluation stack", limits.eval),
            choices: Restorable::with_capacity("choice list", limits.choices),
            fallback: None,
            tags: Restorable::new("tag list"),
            threads: Restorable::new("thread set"),
            containers: Restorable::new("container stack"),
            next_thread: 0,
            eval_mode: false,
            string_mode: false,
            tag_mode: false,
            pending_record: None,
            seen_text: false,
            rng: Prng::new(0),
            bindings: HashMap::new(),
            saved: None,
            abort_speculation: false,
            dead: false,
        }
    }

    /// The globals object this runner shares.
    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    // -- public surface -----------------------------------------------------

    /// Whether more output can be produced without a `choose`.
    pub fn can_continue(&self) -> bool {
        !self.dead
            && (self.ip.is_some() || (self.choices.is_empty() && self.fallback.is_some()))
    }

    /// Execute until the next line boundary and return the rendered line.
    ///
    /// Tags collected for the returned line stay queryable until the next
    /// `getline`.
    pub fn getline(&mut self) -> Result<String> {
        self.ensure_alive()?;
        self.tags.retain(|t| t.level != TagLevel::Line);
        self.advance_line()?;
        let line = {
            let store = self.globals.borrow();
            let ctx = make_ctx(self.story, &store);
            self.output.get_line(&ctx)
        };
        if !line.is_empty() {
            self.seen_text = true;
        }
        Ok(line)
    }

    /// Execute one line and discard it.
    pub fn getline_silent(&mut self) -> Result<()> {
        self.getline().map(|_| ())
    }

    /// Drain every remaining line until input is required or the story ends.
    pub fn getall(&mut self) -> Result<String> {
        let mut out = String::new();
        while self.can_continue() {
            let line = self.getline()?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    pub fn has_choices(&self) -> bool {
        !self.choices.is_empty()
    }

    pub fn num_choices(&self) -> usize {
        self.choices.len()
    }

    pub fn get_choice(&self, index: usize) -> Option<&Choice> {
        self.choices.get(index)
    }

    pub fn choices(&self) -> impl Iterator<Item = &Choice> {
        self.choices.iter()
    }

    /// Follow the choice at `index`. Out-of-range indices are reported and
    /// leave the runner untouched.
    pub fn choose(&mut self, index: usize) -> Result<()> {
        self.ensure_alive()?;
        let Some(choice) = self.choices.get(index).cloned() else {
            return Err(Error::ChoiceOutOfRange {
                index,
                count: self.choices.len(),
            });
        };
        debug!(target: "weft.runner", index, path = choice.path, "choose");

        {
            let mut store = self.globals.borrow_mut();
            store.next_turn();
            if choice.once_only {
                store.mark_picked(choice.path);
            }
        }

        self.choices.clear();
        self.fallback = None;
        self.tags.retain(|t| t.level == TagLevel::Global);
        self.threads.clear();

        // The captured text reads back as the picked line.
        if !choice.captured.is_empty() {
            let handle = self
                .globals
                .borrow_mut()
                .strings
                .alloc(choice.captured.clone());
            let store = self.globals.borrow();
            let ctx = make_ctx(self.story, &store);
            self.output
                .append_all(&[Value::Str(StrRef::Heap(handle)), Value::Newline], &ctx)?;
        }

        self.jump(choice.path, true);
        Ok(())
    }

    // -- tags ---------------------------------------------------------------

    pub fn has_tags(&self) -> bool {
        self.num_tags() > 0
    }

    pub fn num_tags(&self) -> usize {
        self.tags
            .iter()
            .filter(|t| t.level != TagLevel::Global)
            .count()
    }

    pub fn get_tag(&self, index: usize) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.level != TagLevel::Global)
            .nth(index)
            .map(|t| t.text.as_str())
    }

    pub fn num_global_tags(&self) -> usize {
        self.tags
            .iter()
            .filter(|t| t.level == TagLevel::Global)
            .count()
    }

    pub fn get_global_tag(&self, index: usize) -> Option<&str> {
        self.tags
            .iter()
            .filter(|t| t.level == TagLevel::Global)
            .nth(index)
            .map(|t| t.text.as_str())
    }

    // -- navigation ---------------------------------------------------------

    /// Divert to the named knot or stitch. Pending choices are cleared.
    /// Returns false (leaving the runner untouched) for unknown paths.
    pub fn move_to(&mut self, path: u32) -> bool {
        if self.dead {
            return false;
        }
        let Some(container) = self.story.find_container(path) else {
            return false;
        };
        let target = container.start;

        self.choices.clear();
        self.fallback = None;
        self.tags.retain(|t| t.level == TagLevel::Global);
        self.threads.clear();
        self.eval.clear();
        self.eval_mode = false;
        self.string_mode = false;
        self.tag_mode = false;

        self.jump(target, true);
        true
    }

    // -- externals ----------------------------------------------------------

    /// Bind a host function callable from the story.
    ///
    /// Functions not marked `lookahead_safe` are never invoked during
    /// speculative execution: the runner abandons the speculation and calls
    /// them once the surrounding line has committed.
    pub fn bind_external<F>(&mut self, name: u32, lookahead_safe: bool, func: F)
    where
        F: FnMut(&[ExtValue]) -> ExtValue + 'static,
    {
        self.bindings.insert(
            name,
            Binding {
                func: Box::new(func),
                lookahead_safe,
            },
        );
    }

    pub fn set_rng_seed(&mut self, seed: u32) {
        self.rng.seed(seed);
    }

    /// Serialize the shared globals plus this runner's full state.
    pub fn create_snapshot(&self) -> Vec<u8> {
        debug_assert!(self.saved.is_none(), "snapshot during speculation");
        snapshot::create(self)
    }

    // -- gc -----------------------------------------------------------------

    /// Mark every string and list handle reachable from this runner.
    pub(crate) fn mark_used(&self, marks: &mut Marks) {
        for v in self.output.entries() {
            marks.mark_value(v);
        }
        for v in self.eval.iter() {
            marks.mark_value(v);
        }
        for entry in self.stack.iter() {
            if let StackEntry::Var { value, .. } = entry {
                marks.mark_value(value);
            }
        }
    }

    // -- line assembly ------------------------------------------------------

    fn ensure_alive(&self) -> Result<()> {
        if self.dead { Err(Error::Dead) } else { Ok(()) }
    }

    /// Run the step loop until a line is committed, choices block execution,
    /// or the story ends.
    fn advance_line(&mut self) -> Result<()> {
        // A complete line may already be buffered (e.g. echoed choice text).
        if self.output.has_line() && !self.is_saved() {
            return Ok(());
        }

        loop {
            if self.ip.is_none() {
                debug_assert!(!self.is_saved());
                // Flow halted. A lone invisible default is followed
                // automatically when no normal choice was offered.
                if self.choices.is_empty()
                    && let Some(fb) = self.fallback.take()
                {
                    trace!(target: "weft.runner", path = fb.path, "fallback choice");
                    self.jump(fb.path, true);
                    continue;
                }
                break;
            }

            match self.line_step() {
                Ok(true) => break,
                Ok(false) => {}
                Err(err) => {
                    if self.is_saved() {
                        // Contained: rewind to the committed line boundary
                        // and report without killing the runner.
                        self.restore();
                        return Err(err);
                    }
                    if err.is_fatal() {
                        self.dead = true;
                    }
                    return Err(err);
                }
            }
        }

        if self.is_saved() {
            self.forget();
        }
        Ok(())
    }

    /// One instruction plus line-boundary bookkeeping. Returns true when the
    /// current line is complete.
    fn line_step(&mut self) -> Result<bool> {
        self.step()?;

        if self.abort_speculation {
            // An unsafe external was reached mid-speculation: commit the
            // line as-is; the call re-executes on the next line.
            self.abort_speculation = false;
            self.restore();
            return Ok(true);
        }

        // String and tag captures keep their intermediate text in the output
        // stream; line logic waits until the capture closes.
        if self.string_mode || self.tag_mode {
            return Ok(false);
        }

        if !self.is_saved() {
            if !self.eval_mode && self.output.ends_with(ValueKind::Newline) {
                if self.ip.is_none() {
                    return Ok(true);
                }
                // A line boundary. Speculate ahead to see whether glue
                // cancels it or more text extends it.
                self.save();
            }
            return Ok(false);
        }

        match self.detect_change() {
            Change::ExtendedPastNewline => {
                // Printable text followed the newline: the line ends there.
                // Unwind the speculation; it re-executes after getline.
                self.restore();
                Ok(true)
            }
            Change::NewlineRemoved => {
                // Glue cancelled the boundary: commit and keep building.
                self.forget();
                self.output.collapse_glue();
                Ok(false)
            }
            Change::NoChange => {
                if self.ip.is_none() {
                    self.forget();
                    return Ok(true);
                }
                Ok(false)
            }
        }
    }

    fn detect_change(&self) -> Change {
        let store = self.globals.borrow();
        let ctx = make_ctx(self.story, &store);
        if self.output.text_past_save(&ctx) {
            return Change::ExtendedPastNewline;
        }
        if self.output.ends_with(ValueKind::Glue) && self.output.saved_ends_with(ValueKind::Newline)
        {
            return Change::NewlineRemoved;
        }
        Change::NoChange
    }

    // -- runner-wide speculation --------------------------------------------

    fn is_saved(&self) -> bool {
        self.saved.is_some()
    }

    fn save(&mut self) {
        debug_assert!(self.saved.is_none(), "nested save");
        self.output.save();
        self.stack.save();
        self.eval.save();
        self.choices.save();
        self.tags.save();
        self.threads.save();
        self.containers.save();
        self.globals.borrow_mut().save();
        self.saved = Some(SavedScalars {
            ip: self.ip,
            eval_mode: self.eval_mode,
            string_mode: self.string_mode,
            tag_mode: self.tag_mode,
            next_thread: self.next_thread,
            fallback: self.fallback.clone(),
            rng_state: self.rng.state(),
            seen_text: self.seen_text,
            pending_record: self.pending_record,
        });
    }

    fn restore(&mut self) {
        self.output.restore();
        self.stack.restore();
        self.eval.restore();
        self.choices.restore();
        self.tags.restore();
        self.threads.restore();
        self.containers.restore();
        self.globals.borrow_mut().restore();
        if let Some(scalars) = self.saved.take() {
            self.ip = scalars.ip;
            self.eval_mode = scalars.eval_mode;
            self.string_mode = scalars.string_mode;
            self.tag_mode = scalars.tag_mode;
            self.next_thread = scalars.next_thread;
            self.fallback = scalars.fallback;
            self.rng.set_state(scalars.rng_state);
            self.seen_text = scalars.seen_text;
            self.pending_record = scalars.pending_record;
        }
    }

    fn forget(&mut self) {
        self.output.forget();
        self.stack.forget();
        self.eval.forget();
        self.choices.forget();
        self.tags.forget();
        self.threads.forget();
        self.containers.forget();
        self.globals.borrow_mut().forget();
        self.saved = None;
    }

    // -- the step -----------------------------------------------------------

    fn step(&mut self) -> Result<()> {
        let Some(ip) = self.ip else {
            return Ok(());
        };
        let op = self.story.op_at(ip)?;
        self.ip = Some(ip + 1);
        trace!(target: "weft.runner", ip, ?op, "step");

        let mut jumped = false;
        match op {
            Op::Nop => {}

            // --- Content ---
            Op::Str(i) => {
                let v = Value::Str(StrRef::Const(i));
                if self.eval_mode && !self.string_mode {
                    self.eval.push(v)?;
                } else {
                    self.append_output(v)?;
                }
            }
            Op::Newline => self.append_output(Value::Newline)?,
            Op::Glue => self.append_output(Value::Glue)?,

            // --- Control flow ---
            Op::Divert {
                target,
                record_visits,
            } => {
                self.jump(target, record_visits);
                jumped = true;
            }
            Op::DivertIf { target } => {
                if self.pop_eval()?.is_truthy() {
                    self.jump(target, true);
                    jumped = true;
                }
            }
            Op::Call { target } => {
                self.start_frame(FrameKind::Function, ip + 1, target)?;
                jumped = true;
            }
            Op::Tunnel { target } => {
                self.start_frame(FrameKind::Tunnel, ip + 1, target)?;
                jumped = true;
            }
            Op::Thread { target } => {
                self.start_thread(ip + 1, target)?;
                jumped = true;
            }
            Op::Ret => {
                self.execute_return(FrameKind::Function)?;
                jumped = true;
            }
            Op::TunnelRet => {
                self.execute_return(FrameKind::Tunnel)?;
                jumped = true;
            }
            Op::Done => {
                self.on_done()?;
                jumped = true;
            }
            Op::End => {
                self.ip = None;
                if !self.choices.is_saved() {
                    self.choices.clear();
                }
                self.fallback = None;
            }

            // --- Literals ---
            Op::PushInt(v) => self.eval.push(Value::Int(v))?,
            Op::PushFloat(v) => self.eval.push(Value::Float(v))?,
            Op::PushBool(v) => self.eval.push(Value::Bool(v))?,
            Op::PushDivert(t) => self.eval.push(Value::Divert(t))?,
            Op::PushNone => self.eval.push(Value::None)?,
            Op::PushList(i) => {
                let set = self
                    .story
                    .list_literals
                    .get(i as usize)
                    .cloned()
                    .unwrap_or_default();
                let handle = self.globals.borrow_mut().lists.alloc(set);
                self.eval.push(Value::List(ListRef(handle)))?;
            }

            // --- Operators ---
            Op::Binary(binop) => {
                let right = self.pop_eval()?;
                let left = self.pop_eval()?;
                let result = {
                    let mut store = self.globals.borrow_mut();
                    let store = &mut *store;
                    let mut env = OpEnv {
                        consts: &self.story.consts,
                        strings: &mut store.strings,
                        lists: &mut store.lists,
                        list_defs: &self.story.list_defs,
                    };
                    ops::apply_binary(binop, left, right, &mut env)?
                };
                self.eval.push(result)?;
            }
            Op::Unary(unop) => {
                let operand = self.pop_eval()?;
                let result = {
                    let mut store = self.globals.borrow_mut();
                    let store = &mut *store;
                    let mut env = OpEnv {
                        consts: &self.story.consts,
                        strings: &mut store.strings,
                        lists: &mut store.lists,
                        list_defs: &self.story.list_defs,
                    };
                    ops::apply_unary(unop, operand, &mut env)?
                };
                self.eval.push(result)?;
            }
            Op::ListRange => {
                let max = self.pop_int()?;
                let min = self.pop_int()?;
                let list = self.pop_eval()?;
                let Value::List(l) = list else {
                    return Err(Error::Type {
                        expected: "list",
                        got: list.type_name(),
                    });
                };
                let handle = {
                    let mut store = self.globals.borrow_mut();
                    let set = store.lists.get(l.0).to_vec();
                    let ranged = crate::lists::range(&set, min, max);
                    store.lists.alloc(ranged)
                };
                self.eval.push(Value::List(ListRef(handle)))?;
            }

            // --- Output control ---
            Op::BeginEval => self.eval_mode = true,
            Op::EndEval => self.eval_mode = false,
            Op::Out => {
                let v = self.pop_eval()?;
                self.append_output(v)?;
            }
            Op::Pop => {
                self.pop_eval()?;
            }
            Op::Dup => {
                let v = *self.eval.peek().ok_or(Error::StackUnderflow)?;
                self.eval.push(v)?;
            }
            Op::BeginStr => {
                self.string_mode = true;
                self.append_output(Value::StrStart)?;
            }
            Op::EndStr => {
                self.string_mode = false;
                let text = {
                    let store = self.globals.borrow();
                    let ctx = make_ctx(self.story, &store);
                    self.output.extract_since(ValueKind::StrStart, &ctx)
                }
                .ok_or(Error::InvalidInstruction(ip))?;
                let handle = self.globals.borrow_mut().strings.alloc(text);
                self.eval.push(Value::Str(StrRef::Heap(handle)))?;
            }
            Op::BeginTag => {
                self.tag_mode = true;
                self.append_output(Value::TagStart)?;
            }
            Op::EndTag => {
                self.tag_mode = false;
                let text = {
                    let store = self.globals.borrow();
                    let ctx = make_ctx(self.story, &store);
                    self.output.extract_since(ValueKind::TagStart, &ctx)
                }
                .ok_or(Error::InvalidInstruction(ip))?;
                let level = self.tag_level();
                self.tags.push(Tag {
                    text: text.trim().to_string(),
                    level,
                })?;
            }

            // --- Variables ---
            Op::GetVar { name, hint } => {
                let v = self.get_var(name, hint)?;
                self.eval.push(v)?;
            }
            Op::SetVar { name, redef } => {
                let v = self.pop_eval()?;
                self.set_var(name, v, redef)?;
            }
            Op::DefLocal { name } => {
                let value = self.pop_eval()?;
                self.stack.push(StackEntry::Var { name, value })?;
            }
            Op::PushVarRef { name } => self.eval.push(Value::VarPointer {
                name,
                hint: ScopeHint::None,
            })?,
            Op::Deref => {
                let v = self.pop_eval()?;
                let Value::VarPointer { name, hint } = v else {
                    return Err(Error::Type {
                        expected: "variable pointer",
                        got: v.type_name(),
                    });
                };
                let value = self.get_var(name, hint)?;
                self.eval.push(value)?;
            }

            // --- Choices ---
            Op::Choice { flags, target } => self.build_choice(flags, target)?,

            // --- Containers ---
            Op::Enter { id, flags } => {
                self.containers.push(id)?;
                let record = self.pending_record.unwrap_or(true);
                if record && flags & CONTAINER_RECORD_VISITS != 0 {
                    self.globals
                        .borrow_mut()
                        .record_visit(id, flags & CONTAINER_RECORD_TURNS != 0);
                }
            }
            Op::Exit { id } => {
                let top = self.containers.pop();
                debug_assert_eq!(top, Some(id), "mismatched container exit");
            }

            // --- Counters ---
            Op::Visits => {
                let count = self
                    .containers
                    .peek()
                    .map_or(0, |&id| self.globals.borrow().visit_count(id));
                self.eval.push(Value::Int(count as i32))?;
            }
            Op::ReadCount { container } => {
                let count = self.globals.borrow().visit_count(container);
                self.eval.push(Value::Int(count as i32))?;
            }
            Op::TurnsSince => {
                let v = self.pop_eval()?;
                let target = match v {
                    Value::Divert(t) | Value::DivertValue { target: t, .. } => t,
                    other => {
                        return Err(Error::Type {
                            expected: "divert",
                            got: other.type_name(),
                        });
                    }
                };
                let turns = self
                    .story
                    .container_starting_at(target)
                    .map_or(-1, |c| self.globals.borrow().turns_since(c.id));
                self.eval.push(Value::Int(turns))?;
            }
            Op::Seq { count, seed } => {
                // The enclosing container must record visits; iteration 0 is
                // the first visit.
                let container = self.containers.peek().copied().unwrap_or(0);
                let iteration = self
                    .globals
                    .borrow()
                    .visit_count(container)
                    .saturating_sub(1);
                self.eval
                    .push(Value::Int(shuffled_index(iteration, count, seed) as i32))?;
            }
            Op::Random => {
                let max = self.pop_int()?;
                let min = self.pop_int()?;
                let span = (max - min + 1).max(1) as u32;
                let roll = min + self.rng.below(span) as i32;
                self.eval.push(Value::Int(roll))?;
            }

            // --- Externals ---
            Op::CallExternal { name, args } => self.call_external(name, args as usize)?,
        }

        // A jump's visit-recording override survives only through the Enter
        // markers at its landing site.
        if !jumped && !matches!(op, Op::Enter { .. }) {
            self.pending_record = None;
        }
        Ok(())
    }

    // -- dispatch helpers ---------------------------------------------------

    fn pop_eval(&mut self) -> Result<Value> {
        self.eval.pop().ok_or(Error::StackUnderflow)
    }

    fn pop_int(&mut self) -> Result<i32> {
        let v = self.pop_eval()?;
        v.as_int().ok_or(Error::Type {
            expected: "int",
            got: v.type_name(),
        })
    }

    fn append_output(&mut self, v: Value) -> Result<()> {
        let store = self.globals.borrow();
        let ctx = make_ctx(self.story, &store);
        self.output.append(v, &ctx)
    }

    /// Transfer control, rebuilding the container stack for the new
    /// location and recording visits for containers the jump enters.
    fn jump(&mut self, target: u32, record_visits: bool) {
        self.rebuild_containers(target, record_visits);
        self.ip = Some(target);
        self.pending_record = Some(record_visits);
    }

    /// Control transfer for returns: no visit recording.
    fn goto(&mut self, target: u32) {
        self.rebuild_containers(target, false);
        self.ip = Some(target);
        self.pending_record = None;
    }

    fn rebuild_containers(&mut self, target: u32, record_visits: bool) {
        let new_ids = self.story.containers_enclosing(target);
        if record_visits {
            for id in &new_ids {
                if !self.containers.as_slice().contains(id)
                    && let Some(c) = self.story.container(*id)
                    && c.flags & CONTAINER_RECORD_VISITS != 0
                {
                    self.globals
                        .borrow_mut()
                        .record_visit(*id, c.flags & CONTAINER_RECORD_TURNS != 0);
                }
            }
        }
        self.containers.set_items(new_ids);
    }

    fn start_frame(&mut self, kind: FrameKind, return_ip: u32, target: u32) -> Result<()> {
        self.stack.push(StackEntry::Frame(Frame {
            kind,
            return_ip,
            eval_mode: self.eval_mode,
            string_mode: self.string_mode,
            thread: None,
        }))?;
        if kind == FrameKind::Function {
            self.append_output(Value::FuncStart)?;
        }
        // Callee bodies always start in content mode.
        self.eval_mode = false;
        self.string_mode = false;
        self.jump(target, true);
        Ok(())
    }

    fn start_thread(&mut self, return_ip: u32, target: u32) -> Result<()> {
        let id = self.next_thread;
        self.next_thread += 1;
        self.stack.push(StackEntry::Frame(Frame {
            kind: FrameKind::Thread,
            return_ip,
            eval_mode: self.eval_mode,
            string_mode: self.string_mode,
            thread: Some(id),
        }))?;
        self.threads.push(id)?;
        self.append_output(Value::ThreadStart)?;
        self.eval_mode = false;
        self.string_mode = false;
        self.jump(target, true);
        Ok(())
    }

    /// Pop locals and the innermost frame, which must match `expected`.
    fn execute_return(&mut self, expected: FrameKind) -> Result<()> {
        while let Some(entry) = self.stack.pop() {
            let StackEntry::Frame(frame) = entry else {
                continue; // locals of the returning scope are discarded
            };
            if frame.kind != expected {
                return Err(Error::FrameMismatch {
                    expected: expected.name(),
                    found: frame.kind.name(),
                });
            }
            self.eval_mode = frame.eval_mode;
            self.string_mode = frame.string_mode;
            if expected == FrameKind::Function {
                let store = self.globals.borrow();
                let ctx = make_ctx(self.story, &store);
                self.output.end_function(&ctx);
            }
            self.goto(frame.return_ip);
            return Ok(());
        }
        Err(Error::FrameMismatch {
            expected: expected.name(),
            found: "nothing",
        })
    }

    /// `Done`: suspend the current flow. Inside a thread, the parent
    /// resumes at the fork point with the thread's choices still live; at
    /// top level the runner halts.
    fn on_done(&mut self) -> Result<()> {
        if self.threads.is_empty() {
            self.ip = None;
            return Ok(());
        }
        while let Some(entry) = self.stack.pop() {
            if let StackEntry::Frame(frame) = entry
                && frame.kind == FrameKind::Thread
            {
                debug_assert_eq!(frame.thread, self.threads.peek().copied());
                self.threads.pop();
                self.eval_mode = frame.eval_mode;
                self.string_mode = frame.string_mode;
                self.goto(frame.return_ip);
                return Ok(());
            }
        }
        Err(Error::FrameMismatch {
            expected: "thread",
            found: "nothing",
        })
    }

    // -- variables ----------------------------------------------------------

    /// Read a local defined since the nearest function/thread boundary.
    fn local_var(&self, name: u32) -> Option<Value> {
        for entry in self.stack.as_slice().iter().rev() {
            match entry {
                StackEntry::Var { name: n, value } if *n == name => return Some(*value),
                StackEntry::Frame(f)
                    if matches!(f.kind, FrameKind::Function | FrameKind::Thread) =>
                {
                    return None;
                }
                _ => {}
            }
        }
        None
    }

    fn set_local(&mut self, name: u32, value: Value) -> bool {
        for entry in self.stack.as_mut_slice().iter_mut().rev() {
            match entry {
                StackEntry::Var { name: n, value: slot } if *n == name => {
                    *slot = value;
                    return true;
                }
                StackEntry::Frame(f)
                    if matches!(f.kind, FrameKind::Function | FrameKind::Thread) =>
                {
                    return false;
                }
                _ => {}
            }
        }
        false
    }

    fn get_var(&self, name: u32, hint: ScopeHint) -> Result<Value> {
        if hint != ScopeHint::Global {
            if let Some(v) = self.local_var(name) {
                return Ok(v);
            }
            if hint == ScopeHint::Local {
                return Err(Error::UndefinedVariable(name));
            }
        }
        self.globals
            .borrow()
            .get_var(name)
            .ok_or(Error::UndefinedVariable(name))
    }

    fn set_var(&mut self, name: u32, value: Value, redef: bool) -> Result<()> {
        if self.set_local(name, value) {
            return Ok(());
        }
        let mut store = self.globals.borrow_mut();
        if store.set_existing(name, value) {
            return Ok(());
        }
        if redef {
            store.set_var(name, value);
            return Ok(());
        }
        Err(Error::UndefinedVariable(name))
    }

    // -- choices ------------------------------------------------------------

    /// Operand order on the evaluation stack (bottom to top): condition,
    /// start text, choice-only text.
    fn build_choice(&mut self, flags: u8, target: u32) -> Result<()> {
        let choice_only = if flags & CHOICE_HAS_CHOICE_ONLY_TEXT != 0 {
            Some(self.pop_eval()?)
        } else {
            None
        };
        let start = if flags & CHOICE_HAS_START_TEXT != 0 {
            Some(self.pop_eval()?)
        } else {
            None
        };
        let condition = if flags & CHOICE_HAS_CONDITION != 0 {
            self.pop_eval()?.is_truthy()
        } else {
            true
        };

        if !condition {
            return Ok(());
        }
        let once_only = flags & CHOICE_ONCE_ONLY != 0;
        if once_only && self.globals.borrow().is_picked(target) {
            return Ok(());
        }

        let (display, captured) = {
            let store = self.globals.borrow();
            let ctx = make_ctx(self.story, &store);
            let s = start
                .and_then(|v| ctx.render(&v))
                .unwrap_or_default();
            let c = choice_only
                .and_then(|v| ctx.render(&v))
                .unwrap_or_default();
            (format!("{s}{c}").trim().to_string(), s.trim().to_string())
        };

        let choice = Choice {
            index: self.choices.len(),
            text: display,
            captured,
            path: target,
            once_only,
            thread: self.threads.peek().copied(),
        };

        if flags & CHOICE_INVISIBLE_DEFAULT != 0 {
            // One fallback per choice point; the first declared wins.
            if self.fallback.is_none() {
                self.fallback = Some(choice);
            }
        } else {
            self.choices.push(choice)?;
        }
        Ok(())
    }

    // -- tags ---------------------------------------------------------------

    fn tag_level(&self) -> TagLevel {
        if !self.choices.is_empty() {
            return TagLevel::Choice;
        }
        if !self.seen_text {
            let store = self.globals.borrow();
            let ctx = make_ctx(self.story, &store);
            if !self.output.has_printable(&ctx) {
                return TagLevel::Global;
            }
        }
        TagLevel::Line
    }

    // -- externals ----------------------------------------------------------

    fn call_external(&mut self, name: u32, argc: usize) -> Result<()> {
        let safe = self
            .bindings
            .get(&name)
            .map(|b| b.lookahead_safe)
            .unwrap_or(false);
        if self.is_saved() && !safe {
            self.abort_speculation = true;
            return Ok(());
        }

        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            args.push(self.pop_eval()?);
        }
        args.reverse();

        let ext_args: Vec<ExtValue> = {
            let store = self.globals.borrow();
            let ctx = make_ctx(self.story, &store);
            args.iter().map(|v| to_ext(v, &ctx)).collect()
        };

        let Some(binding) = self.bindings.get_mut(&name) else {
            return Err(Error::ExternalNotBound(name));
        };
        let result = (binding.func)(&ext_args);

        let value = match result {
            ExtValue::None => Value::None,
            ExtValue::Bool(b) => Value::Bool(b),
            ExtValue::Int(i) => Value::Int(i),
            ExtValue::Float(f) => Value::Float(f),
            ExtValue::Str(s) => {
                let handle = self.globals.borrow_mut().strings.alloc(s);
                Value::Str(StrRef::Heap(handle))
            }
        };
        if self.eval_mode {
            self.eval.push(value)?;
        } else {
            self.append_output(value)?;
        }
        Ok(())
    }

    // -- snapshot -----------------------------------------------------------

    pub(crate) fn snap(&self, w: &mut Writer) {
        // ip as container id + offset, so images with identical container
        // layouts stay interchangeable across loads.
        match self.ip {
            None => w.bool(false),
            Some(ip) => {
                w.bool(true);
                match self.containers.peek() {
                    Some(&id) => {
                        let start = self.story.container(id).map_or(0, |c| c.start);
                        w.u32(id);
                        w.u32(ip - start);
                    }
                    None => {
                        w.u32(u32::MAX);
                        w.u32(ip);
                    }
                }
            }
        }

        w.u32(self.stack.len() as u32);
        for entry in self.stack.iter() {
            snap_entry(w, entry);
        }

        w.u32(self.eval.len() as u32);
        for v in self.eval.iter() {
            snap_value(w, v);
        }

        let entries = self.output.entries();
        w.u32(entries.len() as u32);
        for v in entries {
            snap_value(w, v);
        }
        w.u32(self.output.last_char() as u32);

        w.u32(self.choices.len() as u32);
        for c in self.choices.iter() {
            c.snap(w);
        }
        match &self.fallback {
            Some(c) => {
                w.bool(true);
                c.snap(w);
            }
            None => w.bool(false),
        }

        w.u32(self.tags.len() as u32);
        for t in self.tags.iter() {
            w.str(&t.text);
            w.u8(match t.level {
                TagLevel::Global => 0,
                TagLevel::Choice => 1,
                TagLevel::Line => 2,
            });
        }

        w.u32(self.threads.len() as u32);
        for t in self.threads.iter() {
            w.u32(*t);
        }
        w.u32(self.next_thread);

        w.u32(self.containers.len() as u32);
        for c in self.containers.iter() {
            w.u32(*c);
        }

        w.bool(self.eval_mode);
        w.bool(self.string_mode);
        w.bool(self.tag_mode);
        w.bool(self.seen_text);
        w.u8(match self.pending_record {
            None => 0,
            Some(false) => 1,
            Some(true) => 2,
        });
        w.u32(self.rng.state());
    }

    pub(crate) fn snap_load(&mut self, r: &mut Reader<'_>) -> Result<()> {
        self.ip = if r.bool()? {
            let container = r.u32()?;
            let offset = r.u32()?;
            let ip = if container == u32::MAX {
                offset
            } else {
                let c = self.story.container(container).ok_or_else(|| {
                    Error::SnapshotCorrupt(format!("unknown container {container}"))
                })?;
                c.start + offset
            };
            if ip as usize >= self.story.ops.len() {
                return Err(Error::SnapshotCorrupt(format!(
                    "instruction pointer {ip} outside the image"
                )));
            }
            Some(ip)
        } else {
            None
        };

        let mut stack = Vec::new();
        for _ in 0..r.u32()? {
            stack.push(read_entry(r)?);
        }
        self.stack.set_items(stack);

        let mut eval = Vec::new();
        for _ in 0..r.u32()? {
            eval.push(read_value(r)?);
        }
        self.eval.set_items(eval);

        let mut entries = Vec::new();
        for _ in 0..r.u32()? {
            entries.push(read_value(r)?);
        }
        let last_char = char::from_u32(r.u32()?).unwrap_or('\0');
        self.output.set_entries(entries, last_char);

        let mut choices = Vec::new();
        for _ in 0..r.u32()? {
            choices.push(Choice::snap_load(r)?);
        }
        self.choices.set_items(choices);
        self.fallback = if r.bool()? {
            Some(Choice::snap_load(r)?)
        } else {
            None
        };

        let mut tags = Vec::new();
        for _ in 0..r.u32()? {
            let text = r.str()?;
            let level = match r.u8()? {
                0 => TagLevel::Global,
                1 => TagLevel::Choice,
                2 => TagLevel::Line,
                other => {
                    return Err(Error::SnapshotCorrupt(format!("bad tag level {other}")));
                }
            };
            tags.push(Tag { text, level });
        }
        self.tags.set_items(tags);

        let mut threads = Vec::new();
        for _ in 0..r.u32()? {
            threads.push(r.u32()?);
        }
        self.threads.set_items(threads);
        self.next_thread = r.u32()?;

        let mut containers = Vec::new();
        for _ in 0..r.u32()? {
            containers.push(r.u32()?);
        }
        self.containers.set_items(containers);

        self.eval_mode = r.bool()?;
        self.string_mode = r.bool()?;
        self.tag_mode = r.bool()?;
        self.seen_text = r.bool()?;
        self.pending_record = match r.u8()? {
            0 => None,
            1 => Some(false),
            2 => Some(true),
            other => {
                return Err(Error::SnapshotCorrupt(format!(
                    "bad pending-record byte {other}"
                )));
            }
        };
        self.rng.set_state(r.u32()?);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// Visit-indexed shuffle: every full cycle through a sequence reshuffles,
/// but the order within one cycle is stable, so snapshots replay it.
fn shuffled_index(visits: u32, count: u32, salt: u32) -> u32 {
    if count == 0 {
        return 0;
    }
    let cycle = visits / count;
    let pos = (visits % count) as usize;
    let mut rng = Prng::new(salt ^ cycle.wrapping_mul(0x9e37_79b9) ^ 0x5eed);
    let mut order: Vec<u32> = (0..count).collect();
    for i in (1..count as usize).rev() {
        let j = rng.below(i as u32 + 1) as usize;
        order.swap(i, j);
    }
    order[pos]
}

fn to_ext(v: &Value, ctx: &RenderCtx<'_>) -> ExtValue {
    match v {
        Value::None => ExtValue::None,
        Value::Bool(b) => ExtValue::Bool(*b),
        Value::Int(i) => ExtValue::Int(*i),
        Value::Float(f) => ExtValue::Float(*f),
        Value::Str(r) => ExtValue::Str(ctx.str_of(*r).to_string()),
        other => ExtValue::Str(ctx.render(other).unwrap_or_default()),
    }
}

fn snap_entry(w: &mut Writer, entry: &StackEntry) {
    match entry {
        StackEntry::Var { name, value } => {
            w.u8(0);
            w.u32(*name);
            snap_value(w, value);
        }
        StackEntry::Frame(f) => {
            w.u8(1);
            w.u8(match f.kind {
                FrameKind::Function => 0,
                FrameKind::Tunnel => 1,
                FrameKind::Thread => 2,
            });
            w.u32(f.return_ip);
            w.bool(f.eval_mode);
            w.bool(f.string_mode);
            match f.thread {
                Some(t) => {
                    w.bool(true);
                    w.u32(t);
                }
                None => w.bool(false),
            }
        }
    }
}

fn read_entry(r: &mut Reader<'_>) -> Result<StackEntry> {
    match r.u8()? {
        0 => Ok(StackEntry::Var {
            name: r.u32()?,
            value: read_value(r)?,
        }),
        1 => {
            let kind = match r.u8()? {
                0 => FrameKind::Function,
                1 => FrameKind::Tunnel,
                2 => FrameKind::Thread,
                other => {
                    return Err(Error::SnapshotCorrupt(format!("bad frame kind {other}")));
                }
            };
            Ok(StackEntry::Frame(Frame {
                kind,
                return_ip: r.u32()?,
                eval_mode: r.bool()?,
                string_mode: r.bool()?,
                thread: if r.bool()? { Some(r.u32()?) } else { None },
            }))
        }
        other => Err(Error::SnapshotCorrupt(format!(
            "bad stack entry tag {other}"
        ))),
    }
}
