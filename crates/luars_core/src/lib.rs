// luars_core
// Register-based bytecode VM core for an embeddable Lua 5.3-family language:
// values, tables, closures, metadispatch, garbage collection and the
// host-facing evaluation stack API. Parsing Lua source text is out of
// scope; embedders bring their own front end through the `Compiler` seam.

#[cfg(test)]
mod test;

pub mod chunk;
pub mod compiler;
pub mod error;
pub mod function;
pub mod gc;
pub mod opcode;
pub mod string_pool;
pub mod table;
pub mod value;
pub mod vm;

pub use compiler::Compiler;
pub use error::{LuaError, LuaFullError, LuaResult, TraceFrame};
pub use function::{LuaFunction, NativeFn, NativeFunction, Prototype, Upvalue, UpvalueDesc, UpvalueState};
pub use gc::{FunctionId, TableId, UpvalueId, UserdataId};
pub use opcode::{Instruction, OpCode};
pub use string_pool::{StringId, StringPool};
pub use table::Table;
pub use value::{NumberSubtype, Value, ValueType};
pub use vm::{CallStatus, Frame, PCallOutcome, State, StateOptions};
