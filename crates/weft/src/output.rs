//! The output stream.
//!
//! An append-only buffer of value cells with a save cursor for look-ahead.
//! Glue and whitespace are normalized twice: once structurally on append
//! (glue strips trailing blank entries, newlines deduplicate) and once
//! textually on render (whitespace is buffered and dropped at glue markers
//! and line edges). Entries before the save cursor are never mutated, so a
//! restore is always exact.

use crate::error::Result;
use crate::lists::{self, ListDef, ListTable};
use crate::strings::StringTable;
use crate::value::{StrRef, Value, ValueKind};

/// Borrowed view of everything needed to turn value cells into text.
pub(crate) struct RenderCtx<'a> {
    pub consts: &'a [String],
    pub strings: &'a StringTable,
    pub lists: &'a ListTable,
    pub list_defs: &'a [ListDef],
}

impl RenderCtx<'_> {
    pub fn str_of(&self, r: StrRef) -> &str {
        match r {
            StrRef::Const(i) => self.consts.get(i as usize).map(String::as_str).unwrap_or(""),
            StrRef::Heap(h) => self.strings.get(h),
        }
    }

    /// Printable text of a cell, or `None` for markers and control values.
    pub fn render(&self, v: &Value) -> Option<String> {
        match v {
            Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(render_float_text(*f)),
            Value::Uint(u) => Some(u.to_string()),
            Value::Str(r) => Some(self.str_of(*r).to_string()),
            Value::List(l) => Some(lists::render(&self.lists.get(l.0).to_vec(), self.list_defs)),
            _ => None,
        }
    }

    /// True when the cell renders to no visible text: markers, newlines, and
    /// strings of pure whitespace.
    pub fn is_blank(&self, v: &Value) -> bool {
        match v {
            Value::Newline => true,
            Value::Str(r) => self.str_of(*r).chars().all(char::is_whitespace),
            other => !other.is_printable(),
        }
    }
}

/// Floats print without a trailing `.0` when integral.
pub(crate) fn render_float_text(f: f32) -> String {
    if f.fract() == 0.0 && f.abs() < 1e7 {
        format!("{}", f as i64)
    } else {
        f.to_string()
    }
}

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct OutputStream {
    entries: Vec<Value>,
    save: Option<usize>,
    last_char: char,
    cap: Option<usize>,
}

impl OutputStream {
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            entries: Vec::new(),
            save: None,
            last_char: '\0',
            cap,
        }
    }

    /// First index the current speculation may mutate.
    fn floor(&self) -> usize {
        self.save.unwrap_or(0)
    }

    pub fn append(&mut self, v: Value, ctx: &RenderCtx<'_>) -> Result<()> {
        match v {
            Value::Newline => {
                // Exactly one newline marker between lines: drop leading and
                // repeated newlines, and newlines directly after glue.
                match self.entries.last() {
                    None => return Ok(()),
                    Some(Value::Newline) | Some(Value::Glue) => return Ok(()),
                    _ => {}
                }
                self.push(v)?;
                self.last_char = '\n';
            }
            Value::Glue => {
                self.strip_trailing_blanks();
                if self.entries.last() != Some(&Value::Glue) {
                    self.push(v)?;
                }
            }
            Value::Str(r) => {
                if ctx.str_of(r).is_empty() {
                    return Ok(());
                }
                if let Some(c) = ctx.str_of(r).chars().last() {
                    self.last_char = c;
                }
                self.push(v)?;
            }
            other => {
                if let Some(text) = ctx.render(&other)
                    && let Some(c) = text.chars().last()
                {
                    self.last_char = c;
                }
                self.push(other)?;
            }
        }
        Ok(())
    }

    pub fn append_all(&mut self, values: &[Value], ctx: &RenderCtx<'_>) -> Result<()> {
        for v in values {
            self.append(*v, ctx)?;
        }
        Ok(())
    }

    fn push(&mut self, v: Value) -> Result<()> {
        if let Some(cap) = self.cap
            && self.entries.len() >= cap
        {
            return Err(crate::error::Error::CapacityExceeded("output stream", cap));
        }
        self.entries.push(v);
        Ok(())
    }

    /// Pop trailing newline markers down to the save floor. Glue calls this
    /// to absorb the line boundary behind it; whitespace inside string
    /// entries is left alone here and dropped at render time.
    fn strip_trailing_blanks(&mut self) {
        while self.entries.len() > self.floor() {
            match self.entries.last() {
                Some(Value::Newline) => {
                    self.entries.pop();
                }
                Some(Value::Str(_)) => break, // strings may carry inner text
                _ => break,
            }
        }
    }

    /// Re-run glue absorption after a forget released the save floor.
    ///
    /// While the stream was saved, a glue could not physically remove the
    /// protected newline before it; once the speculation commits, collapse
    /// the pair for real.
    pub fn collapse_glue(&mut self) {
        debug_assert!(self.save.is_none(), "collapse during speculation");
        if self.entries.last() != Some(&Value::Glue) {
            return;
        }
        self.entries.pop();
        self.strip_trailing_blanks();
        if self.entries.last() != Some(&Value::Glue) {
            self.entries.push(Value::Glue);
        }
    }

    // -- queries ------------------------------------------------------------

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn last_char(&self) -> char {
        self.last_char
    }

    pub fn ends_with(&self, kind: ValueKind) -> bool {
        self.entries.last().is_some_and(|v| v.kind() == kind)
    }

    /// Kind check on the last entry of the saved region.
    pub fn saved_ends_with(&self, kind: ValueKind) -> bool {
        match self.save {
            Some(save) if save > 0 => self.entries[save - 1].kind() == kind,
            _ => false,
        }
    }

    /// Index just past the most recent marker of `kind`, if present.
    pub fn entries_since(&self, kind: ValueKind) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|v| v.kind() == kind)
            .map(|i| i + 1)
    }

    /// Whether the post-save segment renders any non-whitespace text.
    pub fn text_past_save(&self, ctx: &RenderCtx<'_>) -> bool {
        self.entries[self.floor()..]
            .iter()
            .any(|v| v.is_printable() && !ctx.is_blank(v))
    }

    /// Whether the whole stream renders any non-whitespace text.
    pub fn has_printable(&self, ctx: &RenderCtx<'_>) -> bool {
        self.entries
            .iter()
            .any(|v| v.is_printable() && !ctx.is_blank(v))
    }

    /// Whether a committed line boundary is already buffered.
    pub fn has_line(&self) -> bool {
        self.entries.iter().any(|v| matches!(v, Value::Newline))
    }

    // -- extraction ---------------------------------------------------------

    /// Remove everything back to (and including) the most recent marker of
    /// `kind`, returning the rendered text of the removed segment.
    pub fn extract_since(&mut self, kind: ValueKind, ctx: &RenderCtx<'_>) -> Option<String> {
        let start = self.entries.iter().rposition(|v| v.kind() == kind)?;
        let text = render_entries(&self.entries[start + 1..], ctx);
        self.entries.truncate(start);
        Some(text)
    }

    /// Close a function's output region opened by a `FuncStart` marker.
    ///
    /// A call that produced only whitespace is erased outright so that
    /// speculative calls leave no residue; a call that produced text keeps it,
    /// bracketed by markers the renderer skips.
    pub fn end_function(&mut self, ctx: &RenderCtx<'_>) {
        let Some(after) = self.entries_since(ValueKind::FuncStart) else {
            return;
        };
        let start = after - 1;
        if start < self.floor() {
            // The call began before the save point; its region is protected.
            self.entries.push(Value::FuncEnd);
            return;
        }
        let produced_text = self.entries[start + 1..]
            .iter()
            .any(|v| v.is_printable() && !ctx.is_blank(v));
        if produced_text {
            self.entries.push(Value::FuncEnd);
        } else {
            self.entries.truncate(start);
        }
    }

    /// Consume and render one line: everything up to and including the first
    /// newline marker, or the whole stream if none is present.
    pub fn get_line(&mut self, ctx: &RenderCtx<'_>) -> String {
        debug_assert!(self.save.is_none(), "get_line during speculation");
        let cut = match self.entries.iter().position(|v| matches!(v, Value::Newline)) {
            Some(i) => i + 1,
            None => self.entries.len(),
        };
        let line = render_entries(&self.entries[..cut], ctx);
        self.entries.drain(..cut);
        line
    }

    pub fn clear(&mut self) {
        debug_assert!(self.save.is_none(), "clear during speculation");
        self.entries.clear();
        self.last_char = '\0';
    }

    // -- speculation --------------------------------------------------------

    pub fn save(&mut self) {
        debug_assert!(self.save.is_none(), "nested save");
        self.save = Some(self.entries.len());
    }

    pub fn restore(&mut self) {
        if let Some(save) = self.save.take() {
            self.entries.truncate(save);
        }
    }

    pub fn forget(&mut self) {
        self.save = None;
    }

    pub fn is_saved(&self) -> bool {
        self.save.is_some()
    }

    // -- gc -----------------------------------------------------------------

    pub fn entries(&self) -> &[Value] {
        &self.entries
    }

    pub fn set_entries(&mut self, entries: Vec<Value>, last_char: char) {
        self.entries = entries;
        self.last_char = last_char;
    }
}

/// Render a run of entries: markers skipped, whitespace buffered and dropped
/// at glue markers and at both line edges.
pub(crate) fn render_entries(entries: &[Value], ctx: &RenderCtx<'_>) -> String {
    let mut out = String::new();
    let mut pending = String::new();
    let mut eat_ws = false;

    for entry in entries {
        match entry {
            Value::Glue => {
                pending.clear();
                eat_ws = true;
            }
            Value::Newline => {
                if !eat_ws {
                    pending.push('\n');
                }
            }
            other => {
                let Some(text) = ctx.render(other) else {
                    continue; // markers
                };
                for c in text.chars() {
                    if c.is_whitespace() {
                        if !eat_ws {
                            pending.push(c);
                        }
                    } else {
                        eat_ws = false;
                        if !out.is_empty() {
                            out.push_str(&pending);
                        }
                        pending.clear();
                        out.push(c);
                    }
                }
            }
        }
    }
    // Pending whitespace at the end is the line's trailing edge: trimmed.
    out
}
