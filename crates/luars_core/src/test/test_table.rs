//! `NEWTABLE`/`SETLIST`/`LEN`, plus numeric and generic `for` loops driven
//! entirely through hand-assembled bytecode and one native iterator.

use crate::error::LuaResult;
use crate::function::UpvalueDesc;
use crate::opcode::{float8_encode, Instruction, OpCode};
use crate::value::Value;
use crate::vm::State;

use super::{assert_value_eq, call_main, call_with_upvalues, make_proto};

#[test]
fn table_length_no_holes() {
    let mut state = State::new();
    let proto = make_proto(
        vec![Value::Integer(10), Value::Integer(20), Value::Integer(30)],
        vec![
            Instruction::new_abc(OpCode::NewTable, 0, float8_encode(3), 0),
            Instruction::new_abx(OpCode::LoadK, 1, 0),
            Instruction::new_abx(OpCode::LoadK, 2, 1),
            Instruction::new_abx(OpCode::LoadK, 3, 2),
            Instruction::new_abc(OpCode::SetList, 0, 3, 1),
            Instruction::new_abc(OpCode::Len, 1, 0, 0),
            Instruction::new_abc(OpCode::Return, 1, 2, 0),
        ],
        4,
        vec![],
        vec![],
    );
    let results = call_main(&mut state, proto).unwrap();
    assert_value_eq(results[0], Value::Integer(3));
}

#[test]
fn table_length_with_hole_is_either_border() {
    // Punching a hole in the middle of the sequence makes the `#` border
    // underspecified (any index bordering a nil/non-nil transition is a
    // valid answer); this only pins down that it stays one of the two
    // admissible borders instead of, say, panicking or returning 0.
    let mut state = State::new();
    let proto = make_proto(
        vec![Value::Integer(10), Value::Integer(20), Value::Integer(30), Value::Integer(2)],
        vec![
            Instruction::new_abc(OpCode::NewTable, 0, float8_encode(3), 0),
            Instruction::new_abx(OpCode::LoadK, 1, 0),
            Instruction::new_abx(OpCode::LoadK, 2, 1),
            Instruction::new_abx(OpCode::LoadK, 3, 2),
            Instruction::new_abc(OpCode::SetList, 0, 3, 1),
            Instruction::new_abc(OpCode::LoadNil, 2, 0, 0),
            Instruction::new_abc(OpCode::SetTable, 0, crate::opcode::rk_for_constant(3), 2),
            Instruction::new_abc(OpCode::Len, 1, 0, 0),
            Instruction::new_abc(OpCode::Return, 1, 2, 0),
        ],
        4,
        vec![],
        vec![],
    );
    let results = call_main(&mut state, proto).unwrap();
    let n = results[0].try_integer(state.strings()).unwrap();
    assert!(n == 1 || n == 3, "expected a valid border (1 or 3), got {}", n);
}

#[test]
fn for_loop_with_integral_float_bounds_runs_as_integer_loop() {
    // `for i = 1.0, 3.0, 1.0 do sum = sum + i end`: every bound is a float
    // but each is exactly representable as an integer, so SPEC_FULL.md
    // §4.4 says the loop runs integer-typed. Assert the loop variable
    // comes out as `Value::Integer`, not `Value::Float`.
    let mut state = State::new();
    let proto = make_proto(
        vec![Value::Float(1.0), Value::Float(3.0), Value::Float(1.0)],
        vec![
            Instruction::new_abx(OpCode::LoadK, 0, 0), // init
            Instruction::new_abx(OpCode::LoadK, 1, 1), // limit
            Instruction::new_abx(OpCode::LoadK, 2, 2), // step
            Instruction::new_asbx(OpCode::ForPrep, 0, 0),
            Instruction::new_asbx(OpCode::ForLoop, 0, -1),
            Instruction::new_abc(OpCode::Return, 3, 2, 0),
        ],
        4,
        vec![],
        vec![],
    );
    let results = call_main(&mut state, proto).unwrap();
    match results[0] {
        Value::Integer(i) => assert_eq!(i, 3),
        other => panic!("expected an integer-typed for loop, got {:?}", other),
    }
}

fn mk_iter(state: &mut State) -> LuaResult<usize> {
    state.get_iter(1)?;
    Ok(1)
}

/// Builds `t = {1*1, 2*2}` (well, actually fills `t[1..3]` via a numeric
/// `for`), then sums every value visited by a generic `for ... in mk_iter(t)`
/// driven through `TFORCALL`/`TFORLOOP`.
#[test]
fn numeric_and_generic_for_sum() {
    let mut state = State::new();

    let key = state.intern("mk_iter");
    let globals_id = state.globals_id();
    state.push_closure(mk_iter, "mk_iter", vec![]);
    let f = state.pop();
    state.table_mut(globals_id).raw_set(Value::String(key), f).unwrap();

    // K0=1, K1=3, K2=0 (for-loop init/limit/step), K3="mk_iter".
    let mk_iter_name = state.intern("mk_iter");

    // R0=t, R1/R2/R3=for-internal(init/limit/step), R4=visible i, R5=scratch,
    // R6/R7/R8=generic-for f/s/ctrl, R9/R10=result k/v, R11=sum.
    let proto = make_proto(
        vec![Value::Integer(1), Value::Integer(3), Value::Integer(0), Value::String(mk_iter_name)],
        vec![
            Instruction::new_abc(OpCode::NewTable, 0, 0, 0),
            Instruction::new_abx(OpCode::LoadK, 1, 0), // init=1
            Instruction::new_abx(OpCode::LoadK, 2, 1), // limit=3
            Instruction::new_abx(OpCode::LoadK, 3, 0), // step=1
            Instruction::new_asbx(OpCode::ForPrep, 1, 2),
            Instruction::new_abc(OpCode::Mul, 5, 4, 4), // body@5: i*i
            Instruction::new_abc(OpCode::SetTable, 0, 4, 5), // t[i]=i*i
            Instruction::new_asbx(OpCode::ForLoop, 1, -3),
            Instruction::new_abc(OpCode::GetTabUp, 6, 0, crate::opcode::rk_for_constant(3)), // R6 = _ENV.mk_iter
            Instruction::new_abc(OpCode::Move, 7, 0, 0),
            Instruction::new_abc(OpCode::Call, 6, 2, 2),
            Instruction::new_abc(OpCode::LoadNil, 7, 1, 0),
            Instruction::new_abx(OpCode::LoadK, 11, 2), // sum=0
            Instruction::new_asbx(OpCode::Jmp, 0, 1),
            Instruction::new_abc(OpCode::Add, 11, 11, 10), // body@14: sum+=v
            Instruction::new_abc(OpCode::TForCall, 6, 0, 2),
            Instruction::new_asbx(OpCode::TForLoop, 8, -3),
            Instruction::new_abc(OpCode::Return, 11, 2, 0),
        ],
        12,
        vec![UpvalueDesc {
            name: "_ENV".to_string(),
            is_local: false,
            index: 0,
        }],
        vec![],
    );

    let env_upval = state.new_closed_upvalue(state.globals_value());
    let results = call_with_upvalues(&mut state, proto, vec![env_upval]).unwrap();
    assert_value_eq(results[0], Value::Integer(14));
}
