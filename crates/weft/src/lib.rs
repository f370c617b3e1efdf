//! Weft - the runtime core of a choice-based interactive-narrative engine.
//!
//! Weft executes compiled story images: bytecode produced by an external
//! compiler from a branching narrative script. A [`Story`] is loaded once
//! and shared read-only; each [`Runner`] steps through it, producing a
//! stream of text lines interleaved with choice points. Callers drive the
//! runner, read lines, pick choices, and may snapshot and restore complete
//! runtime state at any line boundary.
//!
//! # Features
//!
//! - **Stepwise execution**: `getline` runs exactly to the next committed
//!   line, using speculative look-ahead to resolve glue and trailing
//!   whitespace before the line is handed out
//! - **Choices and tags**: choice points collect across cooperative thread
//!   forks; tags accumulate at global, choice, and line level
//! - **Shared globals**: variables, visit counts, and once-only choice
//!   memory are shared by every runner of a story
//! - **Snapshots**: byte-exact save and restore of globals plus runner state
//! - **Deterministic**: a seedable PRNG whose state snapshots with the rest
//!
//! # Quick Start
//!
//! ```
//! use weft::{Op, StoryBuilder};
//!
//! // Assemble a two-line story in memory (a compiler would normally
//! // produce the image).
//! let mut b = StoryBuilder::new();
//! b.line("The lantern gutters.");
//! b.line("Darkness wins.");
//! b.emit(Op::End);
//! let story = b.story().unwrap();
//!
//! // Run it.
//! let globals = story.new_globals();
//! let mut runner = story.new_runner(&globals);
//! assert_eq!(runner.getline().unwrap(), "The lantern gutters.");
//! assert_eq!(runner.getline().unwrap(), "Darkness wins.");
//! assert!(!runner.can_continue());
//! ```
//!
//! # Choices
//!
//! ```
//! use weft::{CHOICE_HAS_START_TEXT, Op, StoryBuilder};
//!
//! let mut b = StoryBuilder::new();
//! b.line("A door blocks the way.");
//! let open = b.new_label();
//! b.emit(Op::BeginEval);
//! b.emit(Op::BeginStr);
//! b.text("Open it");
//! b.emit(Op::EndStr);
//! b.emit(Op::EndEval);
//! b.choice(CHOICE_HAS_START_TEXT, open);
//! b.emit(Op::Done);
//! b.place(open);
//! b.line("It creaks open.");
//! b.emit(Op::End);
//! let story = b.story().unwrap();
//!
//! let globals = story.new_globals();
//! let mut runner = story.new_runner(&globals);
//! assert_eq!(runner.getline().unwrap(), "A door blocks the way.");
//! assert!(!runner.can_continue());
//! assert!(runner.has_choices());
//! assert_eq!(runner.get_choice(0).unwrap().text(), "Open it");
//! runner.choose(0).unwrap();
//! assert_eq!(runner.getline().unwrap(), "Open it");
//! assert_eq!(runner.getline().unwrap(), "It creaks open.");
//! ```
//!
//! # Not Included
//!
//! - The source-language compiler (images come from files or
//!   [`StoryBuilder`])
//! - Host-binding layers beyond [`Runner::bind_external`]
//! - OS threads: story "threads" are cooperative forks inside one runner

mod builder;
mod bytecode;
mod error;
mod globals;
mod lists;
mod ops;
mod output;
mod restorable;
mod rng;
mod runner;
mod snapshot;
mod story;
mod strings;
mod value;
mod wire;

pub use builder::{Label, StoryBuilder};
pub use bytecode::{
    BinOp, CHOICE_HAS_CHOICE_ONLY_TEXT, CHOICE_HAS_CONDITION, CHOICE_HAS_START_TEXT,
    CHOICE_INVISIBLE_DEFAULT, CHOICE_ONCE_ONLY, CONTAINER_HAS_CHOICES, CONTAINER_RECORD_TURNS,
    CONTAINER_RECORD_VISITS, Op, UnOp,
};
pub use error::{Error, Result};
pub use globals::{GlobalStore, Globals, Marks, VisitRecord, gc};
pub use lists::ListDef;
pub use runner::{Choice, ExtValue, Runner, StackLimits, TagLevel};
pub use story::{ContainerDef, Story};
pub use value::{FrameKind, ListRef, ScopeHint, StrRef, Value, ValueKind, hash_name};
