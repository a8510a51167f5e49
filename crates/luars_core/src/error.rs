//! Error taxonomy for the core.
//!
//! A small, cheap-to-copy `LuaError` tag for the hot path, with a richer
//! `LuaFullError` produced only when a traceback is actually requested
//! (`PCall` with tracing enabled).

use std::fmt;

use crate::value::Value;

/// One of the error kinds from the specification's taxonomy. Kind, not
/// identifier: two type errors about different operations are both
/// `LuaError::Type`, distinguished only by their message.
#[derive(Debug, Clone)]
pub enum LuaError {
    /// Operand of the wrong type for an operation with no applicable metamethod.
    Type(String),
    /// Non-coercible operands, or integer division/modulo by zero.
    Arithmetic(String),
    /// Nil or NaN used as a table key.
    Key(String),
    /// Indexing or arithmetic attempted on a non-container with no fallback metamethod.
    MissingMetamethod(String),
    /// Malformed binary chunk or compiler failure. Never raised through `PCall`;
    /// returned directly from `load_binary`/`load_text`.
    Load(String),
    /// Raised explicitly by Lua code via `Error()`, carrying an arbitrary value.
    User(Value),
    /// An internal invariant was violated. Should never happen; not meant to be caught.
    Internal(String),
}

impl LuaError {
    pub fn type_error(msg: impl Into<String>) -> Self {
        LuaError::Type(msg.into())
    }

    pub fn arithmetic(msg: impl Into<String>) -> Self {
        LuaError::Arithmetic(msg.into())
    }

    pub fn key(msg: impl Into<String>) -> Self {
        LuaError::Key(msg.into())
    }

    pub fn missing_metamethod(msg: impl Into<String>) -> Self {
        LuaError::MissingMetamethod(msg.into())
    }

    pub fn load(msg: impl Into<String>) -> Self {
        LuaError::Load(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        LuaError::Internal(msg.into())
    }

    /// True for kinds that are recoverable through `PCall`. Load errors
    /// never reach here (they return directly); internal assertions are
    /// technically catchable but indicate a core bug.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, LuaError::Load(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            LuaError::Type(_) => "type error",
            LuaError::Arithmetic(_) => "arithmetic error",
            LuaError::Key(_) => "key error",
            LuaError::MissingMetamethod(_) => "missing metamethod",
            LuaError::Load(_) => "load error",
            LuaError::User(_) => "user error",
            LuaError::Internal(_) => "internal assertion",
        }
    }
}

impl fmt::Display for LuaError {
    /// Context-free rendering. A raised `Value` may be a string, table, or
    /// anything else the user chose to throw; turning it into a precise
    /// message can require `__tostring` dispatch and string-pool access,
    /// neither of which this type has. Callers that need the accurate
    /// message (building a [`LuaFullError`]) should use
    /// `State::describe_error` instead, which has that context.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaError::Type(m)
            | LuaError::Arithmetic(m)
            | LuaError::Key(m)
            | LuaError::MissingMetamethod(m)
            | LuaError::Load(m)
            | LuaError::Internal(m) => write!(f, "{}", m),
            LuaError::User(_) => write!(f, "<error object>"),
        }
    }
}

impl std::error::Error for LuaError {}

/// One entry in a captured traceback: either a Lua frame (source + line)
/// or a native frame.
#[derive(Debug, Clone)]
pub enum TraceFrame {
    Lua { source: String, line: u32 },
    Native,
}

impl fmt::Display for TraceFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceFrame::Lua { source, line } => write!(f, "{}:{}", source, line),
            TraceFrame::Native => write!(f, "(native code)"),
        }
    }
}

/// A [`LuaError`] paired with a rendered message and, if tracing was
/// requested, a captured call stack. This is what `PCall(.., trace = true)`
/// returns on failure.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind_name: &'static str,
    pub message: String,
    pub trace: Vec<TraceFrame>,
}

impl LuaFullError {
    pub fn new(err: &LuaError, message: String, trace: Vec<TraceFrame>) -> Self {
        LuaFullError {
            kind_name: err.kind_name(),
            message,
            trace,
        }
    }
}

impl fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for frame in &self.trace {
            writeln!(f, "\tat {}", frame)?;
        }
        Ok(())
    }
}

impl std::error::Error for LuaFullError {}

pub type LuaResult<T> = Result<T, LuaError>;
