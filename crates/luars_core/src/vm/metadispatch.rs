//! Metatable-mediated dispatch (SPEC_FULL.md §4.5): `__index`, `__newindex`,
//! arithmetic/bitwise/unary, comparison, `__len`, `__concat`, `__call`,
//! `__tostring`, `__pairs`, and the `__metatable` introspection guard.
//!
//! Grounded in the teacher's `execute/metamethod.rs` for the overall shape
//! ("try primary, else look up the tag method, else raise") but rewritten
//! against this crate's own `Value`/`Table`/`State` (the teacher dispatches
//! over Lua 5.5's deferred `MMBIN`/`MMBINI` opcodes emitted by its
//! compiler; this core's instruction set computes the primary op and falls
//! back to a metamethod inline, per SPEC_FULL.md §4.4's one-line
//! instruction contracts, so there is no separate MMBIN-family opcode to
//! dispatch through).

use crate::error::{LuaError, LuaResult};
use crate::string_pool::StringId;
use crate::table::Table;
use crate::value::Value;
use crate::vm::interpreter::call_value;
use crate::vm::state::State;

/// Every metamethod name interned once at `State` construction
/// (SPEC_FULL.md §10.1: string interning is how this core represents
/// names; re-interning `"__index"` on every lookup would be wasteful and
/// would need a `&mut StringPool` at lookup time, which metatable lookups
/// don't otherwise require).
#[derive(Clone, Copy)]
pub struct MetaNames {
    pub index: StringId,
    pub newindex: StringId,
    pub add: StringId,
    pub sub: StringId,
    pub mul: StringId,
    pub modulo: StringId,
    pub pow: StringId,
    pub div: StringId,
    pub idiv: StringId,
    pub band: StringId,
    pub bor: StringId,
    pub bxor: StringId,
    pub shl: StringId,
    pub shr: StringId,
    pub unm: StringId,
    pub bnot: StringId,
    pub len: StringId,
    pub eq: StringId,
    pub lt: StringId,
    pub le: StringId,
    pub concat: StringId,
    pub call: StringId,
    pub tostring: StringId,
    pub pairs: StringId,
    pub metatable: StringId,
}

impl MetaNames {
    pub fn new(strings: &mut crate::string_pool::StringPool) -> Self {
        MetaNames {
            index: strings.intern("__index"),
            newindex: strings.intern("__newindex"),
            add: strings.intern("__add"),
            sub: strings.intern("__sub"),
            mul: strings.intern("__mul"),
            modulo: strings.intern("__mod"),
            pow: strings.intern("__pow"),
            div: strings.intern("__div"),
            idiv: strings.intern("__idiv"),
            band: strings.intern("__band"),
            bor: strings.intern("__bor"),
            bxor: strings.intern("__bxor"),
            shl: strings.intern("__shl"),
            shr: strings.intern("__shr"),
            unm: strings.intern("__unm"),
            bnot: strings.intern("__bnot"),
            len: strings.intern("__len"),
            eq: strings.intern("__eq"),
            lt: strings.intern("__lt"),
            le: strings.intern("__le"),
            concat: strings.intern("__concat"),
            call: strings.intern("__call"),
            tostring: strings.intern("__tostring"),
            pairs: strings.intern("__pairs"),
            metatable: strings.intern("__metatable"),
        }
    }
}

/// Arithmetic/bitwise/unary operator kind (SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
}

impl ArithOp {
    fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::BNot
        )
    }

    fn is_unary(self) -> bool {
        matches!(self, ArithOp::Unm | ArithOp::BNot)
    }

    fn meta_name(self, names: &MetaNames) -> StringId {
        match self {
            ArithOp::Add => names.add,
            ArithOp::Sub => names.sub,
            ArithOp::Mul => names.mul,
            ArithOp::Mod => names.modulo,
            ArithOp::Pow => names.pow,
            ArithOp::Div => names.div,
            ArithOp::IDiv => names.idiv,
            ArithOp::BAnd => names.band,
            ArithOp::BOr => names.bor,
            ArithOp::BXor => names.bxor,
            ArithOp::Shl => names.shl,
            ArithOp::Shr => names.shr,
            ArithOp::Unm => names.unm,
            ArithOp::BNot => names.bnot,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            ArithOp::Add => "add",
            ArithOp::Sub => "sub",
            ArithOp::Mul => "mul",
            ArithOp::Mod => "mod",
            ArithOp::Pow => "pow",
            ArithOp::Div => "div",
            ArithOp::IDiv => "idiv",
            ArithOp::BAnd => "band",
            ArithOp::BOr => "bor",
            ArithOp::BXor => "bxor",
            ArithOp::Shl => "shl",
            ArithOp::Shr => "shr",
            ArithOp::Unm => "unm",
            ArithOp::BNot => "bnot",
        }
    }
}

/// Metatable field lookup for `v`'s type (SPEC_FULL.md §4.5 second
/// paragraph: per-type default metatable for primitives, own metatable
/// for table/userdata).
pub fn get_metamethod(state: &State, v: Value, name: StringId) -> Option<Value> {
    let mt = state.metatable_for(v)?;
    let field = state.table(mt).raw_get(&Value::String(name));
    if field.is_nil() {
        None
    } else {
        Some(field)
    }
}

fn type_name(v: Value) -> String {
    v.type_of().to_string()
}

/// `__index` (SPEC_FULL.md §4.5). Loops rather than recurses so a long
/// `__index` chain (table -> table -> table -> ...) doesn't consume host
/// stack.
pub fn index(state: &mut State, mut base: Value, key: Value) -> LuaResult<Value> {
    loop {
        let is_table = matches!(base, Value::Table(_));
        if let Value::Table(id) = base {
            let raw = state.table(id).raw_get(&key);
            if !raw.is_nil() {
                return Ok(raw);
            }
        }
        let name = state_meta_names(state).index;
        match get_metamethod(state, base, name) {
            None if is_table => return Ok(Value::Nil),
            None => {
                return Err(LuaError::type_error(format!(
                    "attempt to index a {} value",
                    type_name(base)
                )))
            }
            Some(Value::Table(next)) => {
                base = Value::Table(next);
                continue;
            }
            Some(f @ Value::Function(_)) => {
                let results = call_value(state, f, &[base, key], 1)?;
                return Ok(results.into_iter().next().unwrap_or(Value::Nil));
            }
            Some(_) if is_table => return Ok(Value::Nil),
            Some(_) => {
                return Err(LuaError::missing_metamethod(format!(
                    "attempt to index a {} value",
                    type_name(base)
                )))
            }
        }
    }
}

/// `__newindex` (SPEC_FULL.md §4.5).
pub fn newindex(state: &mut State, mut base: Value, key: Value, value: Value) -> LuaResult<()> {
    loop {
        if let Value::Table(id) = base {
            let has_key = !state.table(id).raw_get(&key).is_nil();
            if has_key {
                return state.table_mut(id).raw_set(key, value);
            }
        }
        let is_table = matches!(base, Value::Table(_));
        let name = state_meta_names(state).newindex;
        match get_metamethod(state, base, name) {
            None if is_table => {
                let id = match base {
                    Value::Table(id) => id,
                    _ => unreachable!(),
                };
                return state.table_mut(id).raw_set(key, value);
            }
            None => {
                return Err(LuaError::type_error(format!(
                    "attempt to index a {} value",
                    type_name(base)
                )))
            }
            Some(Value::Table(next)) => {
                base = Value::Table(next);
                continue;
            }
            Some(f @ Value::Function(_)) => {
                call_value(state, f, &[base, key, value], 0)?;
                return Ok(());
            }
            Some(_) if is_table => {
                let id = match base {
                    Value::Table(id) => id,
                    _ => unreachable!(),
                };
                return state.table_mut(id).raw_set(key, value);
            }
            Some(_) => {
                return Err(LuaError::missing_metamethod(format!(
                    "attempt to index a {} value",
                    type_name(base)
                )))
            }
        }
    }
}

fn state_meta_names(state: &State) -> MetaNames {
    state.meta_names()
}

/// Primary (non-metamethod) arithmetic, per SPEC_FULL.md §4.4's coercion
/// table. `None` means "no primary result, fall through to a metamethod".
fn primary_arith(state: &State, op: ArithOp, a: Value, b: Value) -> LuaResult<Option<Value>> {
    let strings = state.strings();
    if op.is_unary() {
        return primary_unary(strings, op, a);
    }
    if op.is_bitwise() {
        let (ia, ib) = match (a.try_integer(strings), b.try_integer(strings)) {
            (Some(ia), Some(ib)) => (ia, ib),
            _ => return Ok(None),
        };
        let r = match op {
            ArithOp::BAnd => ia & ib,
            ArithOp::BOr => ia | ib,
            ArithOp::BXor => ia ^ ib,
            ArithOp::Shl => shift(ia, ib),
            ArithOp::Shr => shift(ia, -ib),
            _ => unreachable!(),
        };
        return Ok(Some(Value::Integer(r)));
    }
    match op {
        ArithOp::Div | ArithOp::Pow => {
            let (fa, fb) = match (a.try_float(strings), b.try_float(strings)) {
                (Some(fa), Some(fb)) => (fa, fb),
                _ => return Ok(None),
            };
            let r = if op == ArithOp::Div { fa / fb } else { fa.powf(fb) };
            Ok(Some(Value::Float(r)))
        }
        ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::Mod => {
            if let (Value::Integer(ia), Value::Integer(ib)) = (a, b) {
                if op == ArithOp::Mod && ib == 0 {
                    return Err(LuaError::arithmetic("attempt to perform 'n%%0'"));
                }
                let r = match op {
                    ArithOp::Add => ia.wrapping_add(ib),
                    ArithOp::Sub => ia.wrapping_sub(ib),
                    ArithOp::Mul => ia.wrapping_mul(ib),
                    ArithOp::Mod => int_mod(ia, ib),
                    _ => unreachable!(),
                };
                return Ok(Some(Value::Integer(r)));
            }
            let (fa, fb) = match (a.try_float(strings), b.try_float(strings)) {
                (Some(fa), Some(fb)) => (fa, fb),
                _ => return Ok(None),
            };
            let r = match op {
                ArithOp::Add => fa + fb,
                ArithOp::Sub => fa - fb,
                ArithOp::Mul => fa * fb,
                ArithOp::Mod => fa - (fa / fb).floor() * fb,
                _ => unreachable!(),
            };
            Ok(Some(Value::Float(r)))
        }
        ArithOp::IDiv => {
            if let (Value::Integer(ia), Value::Integer(ib)) = (a, b) {
                if ib == 0 {
                    return Err(LuaError::arithmetic("attempt to perform 'n//0'"));
                }
                return Ok(Some(Value::Integer(floor_div(ia, ib))));
            }
            let (fa, fb) = match (a.try_float(strings), b.try_float(strings)) {
                (Some(fa), Some(fb)) => (fa, fb),
                _ => return Ok(None),
            };
            Ok(Some(Value::Float((fa / fb).floor())))
        }
        _ => unreachable!(),
    }
}

/// Two's-complement mathematical floor modulo (SPEC_FULL.md §4.4 `//`
/// "mathematical floor division"; `%` follows the same floor convention in
/// Lua: `a % b == a - floor(a/b)*b`).
fn int_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r.wrapping_add(b)
    } else {
        r
    }
}

/// Mathematical floor division (SPEC_FULL.md §4.4 `//`): Rust's built-in
/// `/` truncates toward zero, so a correction is needed whenever the
/// truncating remainder is non-zero and disagrees in sign with the
/// divisor (the same correction `int_mod` applies for `%`, since
/// `a // b == (a - (a % b)) / b` and the two operators must agree).
fn floor_div(a: i64, b: i64) -> i64 {
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        q.wrapping_sub(1)
    } else {
        q
    }
}

/// Shift amount sign reverses direction (SPEC_FULL.md §4.4); shifts by
/// `>= 64` or `<= -64` produce `0` (Lua's own convention for out-of-range
/// shift counts).
fn shift(value: i64, amount: i64) -> i64 {
    if amount <= -64 || amount >= 64 {
        0
    } else if amount >= 0 {
        ((value as u64) << amount) as i64
    } else {
        ((value as u64) >> (-amount)) as i64
    }
}

fn primary_unary(strings: &crate::string_pool::StringPool, op: ArithOp, a: Value) -> LuaResult<Option<Value>> {
    match op {
        ArithOp::Unm => {
            if let Value::Integer(i) = a {
                return Ok(Some(Value::Integer(i.wrapping_neg())));
            }
            Ok(a.try_float(strings).map(|f| Value::Float(-f)))
        }
        ArithOp::BNot => Ok(a.try_integer(strings).map(|i| Value::Integer(!i))),
        _ => unreachable!(),
    }
}

/// Binary/unary arithmetic with metamethod fallback (SPEC_FULL.md §4.4,
/// §4.5 "Arithmetic/bitwise/unary": metamethod looked up first on the left
/// operand, then the right).
pub fn arith(state: &mut State, op: ArithOp, a: Value, b: Value) -> LuaResult<Value> {
    if let Some(v) = primary_arith(state, op, a, b)? {
        return Ok(v);
    }
    let name = op.meta_name(&state.meta_names());
    let mm = get_metamethod(state, a, name).or_else(|| get_metamethod(state, b, name));
    match mm {
        Some(f) => {
            let results = call_value(state, f, &[a, b], 1)?;
            Ok(results.into_iter().next().unwrap_or(Value::Nil))
        }
        None => {
            let bad = if a.is_number() || (op.is_bitwise() && a.try_integer(state.strings()).is_some()) {
                b
            } else {
                a
            };
            Err(LuaError::missing_metamethod(format!(
                "attempt to perform arithmetic ({}) on a {} value",
                op.symbol(),
                type_name(bad)
            )))
        }
    }
}

/// `__eq` (SPEC_FULL.md §4.5): only consulted when raw equality fails and
/// both operands share an observable type (and, per real Lua semantics
/// carried forward since the spec is silent on it, only for table/
/// userdata — primitives compare solely by value).
pub fn equals(state: &mut State, a: Value, b: Value) -> LuaResult<bool> {
    if a.raw_equals(&b) {
        return Ok(true);
    }
    if a.type_of() != b.type_of() {
        return Ok(false);
    }
    let eq_name = state.meta_names().eq;
    let mm = match (a, b) {
        (Value::Table(_), Value::Table(_)) | (Value::Userdata(_), Value::Userdata(_)) => {
            get_metamethod(state, a, eq_name).or_else(|| get_metamethod(state, b, eq_name))
        }
        _ => None,
    };
    match mm {
        Some(f) => {
            let results = call_value(state, f, &[a, b], 1)?;
            Ok(results.into_iter().next().unwrap_or(Value::Nil).to_boolean())
        }
        None => Ok(false),
    }
}

/// `__lt`/`__le` (SPEC_FULL.md §4.5). `__le` falls back to `not __lt(b,a)`
/// when only `__lt` is defined.
pub fn less_than(state: &mut State, a: Value, b: Value) -> LuaResult<bool> {
    if let Some(ord) = a.raw_number_cmp(&b) {
        return Ok(ord == std::cmp::Ordering::Less);
    }
    if let (Value::String(sa), Value::String(sb)) = (a, b) {
        return Ok(state.strings().get(sa).as_bytes() < state.strings().get(sb).as_bytes());
    }
    let lt_name = state.meta_names().lt;
    let mm = get_metamethod(state, a, lt_name).or_else(|| get_metamethod(state, b, lt_name));
    match mm {
        Some(f) => {
            let results = call_value(state, f, &[a, b], 1)?;
            Ok(results.into_iter().next().unwrap_or(Value::Nil).to_boolean())
        }
        None => Err(LuaError::missing_metamethod(format!(
            "attempt to compare two {}/{} values",
            type_name(a),
            type_name(b)
        ))),
    }
}

pub fn less_equal(state: &mut State, a: Value, b: Value) -> LuaResult<bool> {
    if let Some(ord) = a.raw_number_cmp(&b) {
        return Ok(ord != std::cmp::Ordering::Greater);
    }
    if let (Value::String(sa), Value::String(sb)) = (a, b) {
        return Ok(state.strings().get(sa).as_bytes() <= state.strings().get(sb).as_bytes());
    }
    let le_name = state.meta_names().le;
    if let Some(f) = get_metamethod(state, a, le_name).or_else(|| get_metamethod(state, b, le_name)) {
        let results = call_value(state, f, &[a, b], 1)?;
        return Ok(results.into_iter().next().unwrap_or(Value::Nil).to_boolean());
    }
    // fall back to `not (b < a)` per SPEC_FULL.md §4.5.
    less_than(state, b, a).map(|lt| !lt)
}

/// `__len` (SPEC_FULL.md §4.5): raw table length unless overridden.
pub fn length(state: &mut State, v: Value) -> LuaResult<Value> {
    match v {
        Value::String(id) => Ok(Value::Integer(state.strings().get(id).len() as i64)),
        Value::Table(id) => {
            let len_name = state.meta_names().len;
            match get_metamethod(state, v, len_name) {
                Some(f) => {
                    let results = call_value(state, f, &[v], 1)?;
                    Ok(results.into_iter().next().unwrap_or(Value::Nil))
                }
                None => Ok(Value::Integer(state.table(id).length())),
            }
        }
        other => {
            let len_name = state.meta_names().len;
            match get_metamethod(state, other, len_name) {
                Some(f) => {
                    let results = call_value(state, f, &[other], 1)?;
                    Ok(results.into_iter().next().unwrap_or(Value::Nil))
                }
                None => Err(LuaError::missing_metamethod(format!(
                    "attempt to get length of a {} value",
                    type_name(other)
                ))),
            }
        }
    }
}

/// `__concat` (SPEC_FULL.md §4.4 "Concatenation"): fast path for an
/// all-string/number run, else right-to-left pairwise metamethod dispatch.
pub fn concat(state: &mut State, values: &[Value]) -> LuaResult<Value> {
    let strings = state.strings();
    if values.iter().all(|v| matches!(v, Value::String(_)) || v.is_number()) {
        let mut buf = String::new();
        for v in values {
            buf.push_str(&v.to_display_string(strings));
        }
        let id = state.intern(&buf);
        return Ok(Value::String(id));
    }
    // pairwise, right to left.
    let mut acc = *values.last().expect("CONCAT always has >= 1 operand");
    for v in values[..values.len() - 1].iter().rev() {
        acc = concat_pair(state, *v, acc)?;
    }
    Ok(acc)
}

fn concat_pair(state: &mut State, a: Value, b: Value) -> LuaResult<Value> {
    let coercible = |v: &Value| matches!(v, Value::String(_)) || v.is_number();
    if coercible(&a) && coercible(&b) {
        let strings = state.strings();
        let s = format!("{}{}", a.to_display_string(strings), b.to_display_string(strings));
        let id = state.intern(&s);
        return Ok(Value::String(id));
    }
    let name = state.meta_names().concat;
    match get_metamethod(state, a, name).or_else(|| get_metamethod(state, b, name)) {
        Some(f) => {
            let results = call_value(state, f, &[a, b], 1)?;
            Ok(results.into_iter().next().unwrap_or(Value::Nil))
        }
        None => {
            let bad = if coercible(&a) { b } else { a };
            Err(LuaError::missing_metamethod(format!(
                "attempt to concatenate a {} value",
                type_name(bad)
            )))
        }
    }
}

/// `__call` (SPEC_FULL.md §4.5): makes a non-function callable by
/// inserting the meta-function ahead of the original target and
/// original arguments.
pub fn resolve_callable(state: &mut State, target: Value) -> LuaResult<(Value, bool)> {
    if matches!(target, Value::Function(_)) {
        return Ok((target, false));
    }
    let call_name = state.meta_names().call;
    match get_metamethod(state, target, call_name) {
        Some(f) if matches!(f, Value::Function(_)) => Ok((f, true)),
        _ => Err(LuaError::type_error(format!("attempt to call a {} value", type_name(target)))),
    }
}

/// `to_string` (SPEC_FULL.md §4.1/§4.6): `__tostring` wins when present;
/// otherwise the raw rendering, with table/function/userdata formatted as
/// `<type>: 0x<arena index>` (there being no real heap address once
/// values are arena-indexed rather than pointer-boxed).
pub fn tostring(state: &mut State, v: Value) -> LuaResult<String> {
    let name = state.meta_names().tostring;
    if let Some(f) = get_metamethod(state, v, name) {
        let results = call_value(state, f, &[v], 1)?;
        let result = results.into_iter().next().unwrap_or(Value::Nil);
        return match result {
            Value::String(id) => Ok(state.strings().get(id).to_string()),
            other => Ok(other.to_display_string(state.strings())),
        };
    }
    Ok(v.to_display_string(state.strings()))
}

/// `__metatable` guard (SPEC_FULL.md §4.5): when a metatable has this
/// field set, introspection sees it instead of the real metatable, and
/// mutation is rejected.
pub fn metatable_guard(state: &State, mt: crate::gc::TableId) -> Option<Value> {
    let field = state.table(mt).raw_get(&Value::String(state.meta_names().metatable));
    if field.is_nil() {
        None
    } else {
        Some(field)
    }
}

/// `__pairs` (SPEC_FULL.md §4.2 "Respecting iterator"): if present, calls
/// it with `v` and takes its single returned value as the ready-made
/// iterator function value (this core's Host API models the whole
/// `(f, s, var)` triple as one opaque callable returned by `GetIter`, so
/// `__pairs` is expected to hand back something already in that shape —
/// see DESIGN.md's Open Question notes for why this simplifies the
/// three-value protocol real Lua exposes at the language level).
pub fn respecting_iterator(state: &mut State, v: Value) -> LuaResult<Option<Value>> {
    let name = state.meta_names().pairs;
    match get_metamethod(state, v, name) {
        Some(f) => {
            let results = call_value(state, f, &[v], 1)?;
            Ok(Some(results.into_iter().next().unwrap_or(Value::Nil)))
        }
        None => Ok(None),
    }
}

/// Snapshot-materialized raw iterator state (SPEC_FULL.md §9 Decision
/// (a), §4.2 "Raw iterator"). Stored inside a `Userdata` captured as a
/// native closure's upvalue by `Table::snapshot_pairs`'s caller
/// (`hostapi::get_iter`).
pub struct IteratorSnapshot {
    pairs: Vec<(Value, Value)>,
    cursor: usize,
}

impl IteratorSnapshot {
    pub fn new(table: &Table) -> Self {
        IteratorSnapshot {
            pairs: table.snapshot_pairs(),
            cursor: 0,
        }
    }

    /// `(nil, nil)` signals the end (SPEC_FULL.md §4.2).
    pub fn next_pair(&mut self) -> (Value, Value) {
        if self.cursor < self.pairs.len() {
            let p = self.pairs[self.cursor];
            self.cursor += 1;
            p
        } else {
            (Value::Nil, Value::Nil)
        }
    }
}
