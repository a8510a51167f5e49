//! Closures capturing shared upvalues, and `PCall` as a stack isolator.

use std::rc::Rc;

use crate::error::{LuaError, LuaResult};
use crate::function::UpvalueDesc;
use crate::opcode::{Instruction, OpCode};
use crate::value::Value;
use crate::vm::{PCallOutcome, State};

use super::{assert_value_eq, make_proto};

/// `mk()` returns a closure over a local `x`; every call to that closure
/// increments and returns the shared `x`, so three calls to the same
/// returned closure must see `1, 2, 3` rather than each starting fresh.
#[test]
fn closures_share_upvalue_across_calls() {
    let mut state = State::new();

    // proto_inner: upvalue 0 is `x`. `return x + 1` then store it back.
    let proto_inner = make_proto(
        vec![Value::Integer(1)],
        vec![
            Instruction::new_abc(OpCode::GetUpval, 0, 0, 0),
            Instruction::new_abx(OpCode::LoadK, 1, 0),
            Instruction::new_abc(OpCode::Add, 0, 0, 1),
            Instruction::new_abc(OpCode::SetUpval, 0, 0, 0),
            Instruction::new_abc(OpCode::Return, 0, 2, 0),
        ],
        2,
        vec![UpvalueDesc {
            name: "x".to_string(),
            is_local: true,
            index: 0,
        }],
        vec![],
    );

    // proto_mk: R0 = x = 0 (a local, captured by proto_inner); R1 = the inner closure.
    let proto_mk = make_proto(
        vec![Value::Integer(0)],
        vec![
            Instruction::new_abx(OpCode::LoadK, 0, 0),
            Instruction::new_abx(OpCode::Closure, 1, 0),
            Instruction::new_abc(OpCode::Return, 1, 2, 0),
        ],
        2,
        vec![],
        vec![Rc::new(proto_inner)],
    );

    // main: R0 = mk() result (the returned closure, must survive every
    // subsequent call); calls needing 0 results go through scratch R1
    // instead, since a 0-result CALL truncates the stack back to its own
    // func slot and would wipe R0 if reused directly as the call site.
    let main = make_proto(
        vec![],
        vec![
            Instruction::new_abx(OpCode::Closure, 0, 0),
            Instruction::new_abc(OpCode::Call, 0, 1, 2), // f = mk()
            Instruction::new_abc(OpCode::Move, 1, 0, 0),
            Instruction::new_abc(OpCode::Call, 1, 1, 1), // f() -> 1, discarded
            Instruction::new_abc(OpCode::Move, 1, 0, 0),
            Instruction::new_abc(OpCode::Call, 1, 1, 1), // f() -> 2, discarded
            Instruction::new_abc(OpCode::Move, 1, 0, 0),
            Instruction::new_abc(OpCode::Call, 1, 1, 2), // f() -> 3, kept
            Instruction::new_abc(OpCode::Return, 1, 2, 0),
        ],
        2,
        vec![],
        vec![Rc::new(proto_mk)],
    );

    let fid = state.new_lua_function(Rc::new(main), vec![]);
    let base = state.top();
    state.push(Value::Function(fid));
    let n = state.call(0, -1).unwrap();
    let results = state.stack()[base..base + n].to_vec();
    assert_value_eq(results[0], Value::Integer(3));
}

fn raise_boom(state: &mut State) -> LuaResult<usize> {
    let id = state.intern("boom");
    Err(LuaError::User(Value::String(id)))
}

/// `PCall` must restore the stack to its pre-call height and surface the
/// raised value's message, even though the call it wraps never returns.
#[test]
fn pcall_isolates_stack_on_error() {
    let mut state = State::new();
    let height_before = state.top();

    state.push_closure(raise_boom, "raise_boom", vec![]);
    match state.pcall(0, -1, true) {
        PCallOutcome::Err(full) => assert_eq!(full.message, "boom"),
        PCallOutcome::Ok(_) => panic!("expected raise_boom to fail"),
    }

    assert_eq!(state.top(), height_before);
}

/// A `PCall` around a function that succeeds behaves like a plain `Call`.
#[test]
fn pcall_ok_path_returns_results() {
    let mut state = State::new();
    let proto = make_proto(
        vec![Value::Integer(42)],
        vec![Instruction::new_abx(OpCode::LoadK, 0, 0), Instruction::new_abc(OpCode::Return, 0, 2, 0)],
        1,
        vec![],
        vec![],
    );
    let fid = state.new_lua_function(Rc::new(proto), vec![]);
    let base = state.top();
    state.push(Value::Function(fid));
    match state.pcall(0, -1, false) {
        PCallOutcome::Ok(n) => {
            let results = state.stack()[base..base + n].to_vec();
            assert_value_eq(results[0], Value::Integer(42));
        }
        PCallOutcome::Err(e) => panic!("unexpected error: {}", e.message),
    }
}
