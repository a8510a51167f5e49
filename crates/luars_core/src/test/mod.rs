//! Cross-cutting test suite: end-to-end scenarios driven purely through
//! the Host API by constructing `Prototype`/`Instruction` sequences by
//! hand, since source-text compilation is out of this core's scope.
//! Per-module unit tests live inline next to the code they test; this is
//! for behavior that spans modules (a whole call, a whole metadispatch
//! chain, a whole for loop).

mod test_functions;
mod test_gc_metamethods;
mod test_operators;
mod test_table;

use std::rc::Rc;

use crate::error::LuaResult;
use crate::function::{Prototype, UpvalueDesc};
use crate::gc::UpvalueId;
use crate::opcode::Instruction;
use crate::value::Value;
use crate::vm::State;

/// Builds a `Prototype` for a hand-assembled test program; every test
/// scenario is a single flat function with no parameters.
pub(crate) fn make_proto(
    constants: Vec<Value>,
    instructions: Vec<Instruction>,
    max_stack_size: u8,
    upvalues: Vec<UpvalueDesc>,
    protos: Vec<Rc<Prototype>>,
) -> Prototype {
    let line_info = vec![1u32; instructions.len()];
    Prototype {
        source_name: "test".to_string(),
        line_defined: 0,
        last_line_defined: 0,
        param_count: 0,
        is_vararg: false,
        max_stack_size,
        instructions,
        constants,
        upvalues,
        protos,
        line_info,
    }
}

/// Runs `proto` as a fresh closure with the given upvalue cells and 0
/// arguments, collecting every result it returns.
pub(crate) fn call_with_upvalues(state: &mut State, proto: Prototype, upvalues: Vec<UpvalueId>) -> LuaResult<Vec<Value>> {
    let fid = state.new_lua_function(Rc::new(proto), upvalues);
    let base = state.top();
    state.push(Value::Function(fid));
    let n = state.call(0, -1)?;
    let results = state.stack()[base..base + n].to_vec();
    state.truncate(base);
    Ok(results)
}

/// Runs `proto` as a fresh closure with no upvalues and 0 arguments.
pub(crate) fn call_main(state: &mut State, proto: Prototype) -> LuaResult<Vec<Value>> {
    call_with_upvalues(state, proto, vec![])
}

/// `Value` has no `PartialEq` (raw equality needs the string pool for
/// interned content, so it's a method, not a trait impl); this is the
/// `assert_eq!`-shaped helper the test suite uses instead.
pub(crate) fn assert_value_eq(actual: Value, expected: Value) {
    assert!(actual.raw_equals(&expected), "expected {:?}, got {:?}", expected, actual);
}

pub(crate) fn assert_values_eq(actual: &[Value], expected: &[Value]) {
    assert_eq!(actual.len(), expected.len(), "length mismatch: {:?} vs {:?}", actual, expected);
    for (a, e) in actual.iter().zip(expected) {
        assert_value_eq(*a, *e);
    }
}
