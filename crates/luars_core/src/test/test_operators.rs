//! Arithmetic, bitwise and comparison opcodes, hand-assembled one at a time.
//! Comparisons use `LOADBOOL`'s own C-operand skip (not a following `JMP`)
//! to avoid the comparison+jump-fusion idiom real compiler output relies on,
//! since these prototypes are written by hand rather than emitted by one.

use crate::opcode::{rk_for_constant, Instruction, OpCode};
use crate::value::Value;
use crate::vm::State;

use super::{assert_value_eq, call_main, make_proto};

fn binop(op: OpCode, lhs: Value, rhs: Value) -> Value {
    let mut state = State::new();
    let proto = make_proto(
        vec![lhs, rhs],
        vec![
            Instruction::new_abx(OpCode::LoadK, 0, 0),
            Instruction::new_abx(OpCode::LoadK, 1, 1),
            Instruction::new_abc(op, 0, 0, 1),
            Instruction::new_abc(OpCode::Return, 0, 2, 0),
        ],
        2,
        vec![],
        vec![],
    );
    call_main(&mut state, proto).unwrap().into_iter().next().unwrap()
}

fn compare(op: OpCode, a_flag: u32, lhs: Value, rhs: Value) -> bool {
    let mut state = State::new();
    let proto = make_proto(
        vec![lhs, rhs],
        vec![
            Instruction::new_abx(OpCode::LoadK, 1, 0),
            Instruction::new_abx(OpCode::LoadK, 2, 1),
            Instruction::new_abc(op, a_flag, 1, 2),
            Instruction::new_abc(OpCode::LoadBool, 0, 0, 1), // not-matched path: false, skip next
            Instruction::new_abc(OpCode::LoadBool, 0, 1, 0), // matched path: true
            Instruction::new_abc(OpCode::Return, 0, 2, 0),
        ],
        3,
        vec![],
        vec![],
    );
    let results = call_main(&mut state, proto).unwrap();
    results[0].to_boolean()
}

#[test]
fn arithmetic_opcodes() {
    assert_value_eq(binop(OpCode::Add, Value::Integer(2), Value::Integer(3)), Value::Integer(5));
    assert_value_eq(binop(OpCode::Sub, Value::Integer(5), Value::Integer(3)), Value::Integer(2));
    assert_value_eq(binop(OpCode::Mul, Value::Integer(4), Value::Integer(3)), Value::Integer(12));
    assert_value_eq(binop(OpCode::Mod, Value::Integer(7), Value::Integer(3)), Value::Integer(1));
    assert_value_eq(binop(OpCode::Div, Value::Integer(7), Value::Integer(2)), Value::Float(3.5));
    assert_value_eq(binop(OpCode::Pow, Value::Integer(2), Value::Integer(10)), Value::Float(1024.0));
}

/// Floor division rounds toward negative infinity, not toward zero: this
/// pins down the direction for operands of mixed sign on both sides.
#[test]
fn floor_division_rounds_toward_negative_infinity() {
    assert_value_eq(binop(OpCode::IDiv, Value::Integer(7), Value::Integer(-2)), Value::Integer(-4));
    assert_value_eq(binop(OpCode::IDiv, Value::Integer(-7), Value::Integer(2)), Value::Integer(-4));
    assert_value_eq(binop(OpCode::IDiv, Value::Integer(7), Value::Integer(2)), Value::Integer(3));
    assert_value_eq(binop(OpCode::IDiv, Value::Integer(-7), Value::Integer(-2)), Value::Integer(3));
}

#[test]
fn bitwise_and_shift_opcodes() {
    assert_value_eq(binop(OpCode::BAnd, Value::Integer(0b1100), Value::Integer(0b1010)), Value::Integer(0b1000));
    assert_value_eq(binop(OpCode::BOr, Value::Integer(0b1100), Value::Integer(0b1010)), Value::Integer(0b1110));
    assert_value_eq(binop(OpCode::BXor, Value::Integer(0b1100), Value::Integer(0b1010)), Value::Integer(0b0110));
    assert_value_eq(binop(OpCode::Shl, Value::Integer(1), Value::Integer(4)), Value::Integer(16));
    assert_value_eq(binop(OpCode::Shr, Value::Integer(16), Value::Integer(4)), Value::Integer(1));
}

#[test]
fn unary_minus_and_bitwise_not() {
    let mut state = State::new();
    let proto = make_proto(
        vec![Value::Integer(5)],
        vec![
            Instruction::new_abx(OpCode::LoadK, 0, 0),
            Instruction::new_abc(OpCode::Unm, 1, 0, 0),
            Instruction::new_abc(OpCode::BNot, 2, 0, 0),
            Instruction::new_abc(OpCode::Return, 1, 3, 0),
        ],
        3,
        vec![],
        vec![],
    );
    let results = call_main(&mut state, proto).unwrap();
    assert_value_eq(results[0], Value::Integer(-5));
    assert_value_eq(results[1], Value::Integer(!5i64));
}

#[test]
fn not_opcode_negates_truthiness() {
    let mut state = State::new();
    let proto = make_proto(
        vec![],
        vec![
            Instruction::new_abc(OpCode::LoadBool, 0, 1, 0), // R0 = true
            Instruction::new_abc(OpCode::Not, 1, 0, 0),      // R1 = !R0
            Instruction::new_abc(OpCode::Return, 1, 2, 0),
        ],
        2,
        vec![],
        vec![],
    );
    let results = call_main(&mut state, proto).unwrap();
    assert_value_eq(results[0], Value::Boolean(false));
}

#[test]
fn equality_and_ordering_opcodes() {
    assert!(compare(OpCode::Eq, 0, Value::Integer(3), Value::Integer(3)));
    assert!(!compare(OpCode::Eq, 0, Value::Integer(3), Value::Integer(4)));
    assert!(compare(OpCode::Lt, 0, Value::Integer(2), Value::Integer(3)));
    assert!(!compare(OpCode::Lt, 0, Value::Integer(3), Value::Integer(2)));
    assert!(compare(OpCode::Le, 0, Value::Integer(3), Value::Integer(3)));
    assert!(!compare(OpCode::Le, 0, Value::Integer(4), Value::Integer(3)));
}

#[test]
fn concat_joins_stack_range() {
    let mut state = State::new();
    let s1 = state.intern("foo");
    let s2 = state.intern("bar");
    let proto = make_proto(
        vec![Value::String(s1), Value::String(s2)],
        vec![
            Instruction::new_abx(OpCode::LoadK, 0, 0),
            Instruction::new_abx(OpCode::LoadK, 1, 1),
            Instruction::new_abc(OpCode::Concat, 0, 0, 1),
            Instruction::new_abc(OpCode::Return, 0, 2, 0),
        ],
        2,
        vec![],
        vec![],
    );
    let results = call_main(&mut state, proto).unwrap();
    match results[0] {
        Value::String(id) => assert_eq!(state.strings().get(id), "foobar"),
        other => panic!("expected a string, got {:?}", other),
    }
}

#[test]
fn rk_operand_reads_constant_without_loading_it_into_a_register() {
    let mut state = State::new();
    let proto = make_proto(
        vec![Value::Integer(10), Value::Integer(1)],
        vec![
            Instruction::new_abx(OpCode::LoadK, 0, 0),
            Instruction::new_abc(OpCode::Sub, 0, 0, rk_for_constant(1)),
            Instruction::new_abc(OpCode::Return, 0, 2, 0),
        ],
        1,
        vec![],
        vec![],
    );
    let results = call_main(&mut state, proto).unwrap();
    assert_value_eq(results[0], Value::Integer(9));
}
