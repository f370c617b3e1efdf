use thiserror::Error;

/// Errors produced while loading a story image or executing a runner.
///
/// Errors split into two families. *Fatal* errors mean the bytecode broke its
/// contract (or a fixed-capacity stack overflowed); the runner that raised one
/// transitions to a dead state and every later call on it fails with
/// [`Error::Dead`]. *Recoverable* errors report a bad request from the caller
/// — an out-of-range choice, an unknown path, a stale snapshot — and leave
/// the runner untouched.
#[derive(Debug, Error)]
pub enum Error {
    /// An instruction popped more values than the stack held.
    #[error("stack underflow")]
    StackUnderflow,

    /// An operand had the wrong type for the instruction that consumed it.
    #[error("type mismatch: expected {expected}, got {got}")]
    Type {
        expected: &'static str,
        got: &'static str,
    },

    #[error("division by zero")]
    DivisionByZero,

    /// A return instruction unwound into a frame of the wrong kind.
    #[error("frame mismatch: expected a {expected} frame, found {found}")]
    FrameMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// A variable read or non-redefining write named an unknown variable.
    #[error("undefined variable {0:#010x}")]
    UndefinedVariable(u32),

    /// The bytecode called an external function the host never bound.
    #[error("external function {0:#010x} is not bound")]
    ExternalNotBound(u32),

    /// The instruction stream was malformed at the given offset.
    #[error("invalid instruction at offset {0}")]
    InvalidInstruction(u32),

    /// A fixed-capacity container ran out of room.
    #[error("{0} exceeded its fixed capacity of {1}")]
    CapacityExceeded(&'static str, usize),

    /// The runner already died from a previous fatal error.
    #[error("runner is dead after a previous fatal error")]
    Dead,

    /// `choose` was called with an index past the end of the choice list.
    #[error("choice index {index} out of range ({count} available)")]
    ChoiceOutOfRange { index: usize, count: usize },

    /// A snapshot was produced by a different snapshot format version.
    #[error("snapshot version {got} is not the supported version {expected}")]
    SnapshotVersion { expected: u32, got: u32 },

    /// A snapshot failed structural validation while decoding.
    #[error("malformed snapshot: {0}")]
    SnapshotCorrupt(String),

    /// A story image failed structural validation while decoding.
    #[error("malformed story image: {0}")]
    BadImage(String),

    /// A decoder ran off the end of its input.
    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error kills the runner that raised it.
    ///
    /// Load- and snapshot-time errors are never fatal: they are reported
    /// before any runner state has been touched.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::StackUnderflow
                | Error::Type { .. }
                | Error::DivisionByZero
                | Error::FrameMismatch { .. }
                | Error::UndefinedVariable(_)
                | Error::ExternalNotBound(_)
                | Error::InvalidInstruction(_)
                | Error::CapacityExceeded(..)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
