//! The host-facing stack API (SPEC_FULL.md §4.3 "Addressing", §4.6). This
//! is the only surface an embedder is expected to drive directly; the
//! opcode interpreter never calls through it (it talks to `State`'s
//! lower-level `abs_get`/`abs_set`/arena accessors instead).
//!
//! Grounded in the teacher's `lua_vm/lua_state.rs` public method list
//! (`push_*`, `get_*`, `set_*`, `call`, `pcall`) — same "everything is a
//! method on the one state object, addressed by stack index" shape, though
//! the teacher's index resolution is folded into each method rather than
//! factored through a shared `resolve_index` the way this core does.

use std::any::Any;
use std::rc::Rc;

use crate::compiler::Compiler;
use crate::error::{LuaError, LuaFullError, LuaResult};
use crate::function::{Function, NativeFn, Prototype};
use crate::gc::UserdataId;
use crate::value::{NumberSubtype, Value, ValueType};
use crate::vm::interpreter::{call_value, do_call_at};
use crate::vm::metadispatch::{self, IteratorSnapshot};
use crate::vm::state::{ResolvedIndex, State};

/// Outcome of a protected call (SPEC_FULL.md §4.6 `PCall`).
pub enum PCallOutcome {
    Ok(usize),
    Err(LuaFullError),
}

impl State {
    // ---- push primitives (SPEC_FULL.md §4.6 "Push primitives") ----------

    pub fn push_nil(&mut self) {
        self.push(Value::Nil);
    }

    pub fn push_boolean(&mut self, b: bool) {
        self.push(Value::Boolean(b));
    }

    pub fn push_integer(&mut self, i: i64) {
        self.push(Value::Integer(i));
    }

    pub fn push_float(&mut self, f: f64) {
        self.push(Value::Float(f));
    }

    pub fn push_string(&mut self, s: &str) -> Value {
        let id = self.intern(s);
        let v = Value::String(id);
        self.push(v);
        v
    }

    pub fn push_new_table(&mut self, array_hint: usize, hash_hint: usize) -> Value {
        let id = self.new_table(array_hint, hash_hint);
        let v = Value::Table(id);
        self.push(v);
        v
    }

    pub fn push_userdata(&mut self, data: Box<dyn Any>) -> Value {
        let id = self.new_userdata(data);
        let v = Value::Userdata(id);
        self.push(v);
        v
    }

    /// Native closure with captured upvalues; upvalue 0 is always the
    /// globals table (SPEC_FULL.md §3 "Function").
    pub fn push_closure(&mut self, f: NativeFn, name: &'static str, mut upvalues: Vec<Value>) -> Value {
        let globals = self.globals_value();
        let mut ups = Vec::with_capacity(upvalues.len() + 1);
        ups.push(globals);
        ups.append(&mut upvalues);
        let fid = self.new_native_function(f, ups, name);
        let v = Value::Function(fid);
        self.push(v);
        v
    }

    // ---- Pop/Insert/PushIndex/AbsIndex -----------------------------------

    pub fn pop_n(&mut self, n: usize) {
        let top = self.top();
        self.truncate(top.saturating_sub(n));
    }

    /// Moves the top-of-stack value into position `i`, shifting everything
    /// from `i` up by one (SPEC_FULL.md §4.6 `Insert`).
    pub fn insert(&mut self, i: i32) -> LuaResult<()> {
        let v = self.pop();
        match self.resolve_index(i)? {
            ResolvedIndex::Stack(abs) => {
                self.insert_at(abs, v);
                Ok(())
            }
            _ => Err(LuaError::internal("Insert target must be a stack index")),
        }
    }

    /// Duplicates the value at `i` onto the top of the stack (SPEC_FULL.md
    /// §4.6 `PushIndex`).
    pub fn push_index(&mut self, i: i32) -> LuaResult<()> {
        let v = self.get_slot(i)?;
        self.push(v);
        Ok(())
    }

    // ---- TypeOf/SubtypeOf/IsNil -------------------------------------------

    pub fn type_of(&self, i: i32) -> LuaResult<ValueType> {
        Ok(self.get_slot(i)?.type_of())
    }

    pub fn subtype_of(&self, i: i32) -> LuaResult<Option<NumberSubtype>> {
        Ok(self.get_slot(i)?.subtype_of())
    }

    pub fn is_nil(&self, i: i32) -> LuaResult<bool> {
        Ok(self.get_slot(i)?.is_nil())
    }

    // ---- conversions (SPEC_FULL.md §4.6 "Conversions") --------------------

    pub fn to_boolean(&self, i: i32) -> bool {
        self.get_slot(i).map(|v| v.to_boolean()).unwrap_or(false)
    }

    /// Invokes `__tostring` if present (SPEC_FULL.md §4.5).
    pub fn to_string_value(&mut self, i: i32) -> LuaResult<String> {
        let v = self.get_slot(i)?;
        metadispatch::tostring(self, v)
    }

    pub fn try_integer(&self, i: i32) -> Option<i64> {
        let v = self.get_slot(i).ok()?;
        v.try_integer(self.strings())
    }

    pub fn try_float(&self, i: i32) -> Option<f64> {
        let v = self.get_slot(i).ok()?;
        v.try_float(self.strings())
    }

    pub fn to_integer(&self, i: i32) -> LuaResult<i64> {
        self.try_integer(i)
            .ok_or_else(|| LuaError::type_error(format!("value at index {} is not convertible to an integer", i)))
    }

    pub fn to_float(&self, i: i32) -> LuaResult<f64> {
        self.try_float(i)
            .ok_or_else(|| LuaError::type_error(format!("value at index {} is not convertible to a float", i)))
    }

    /// `nil` yields `default`; anything else goes through `to_integer`.
    pub fn opt_integer(&self, i: i32, default: i64) -> LuaResult<i64> {
        if self.get_slot(i)?.is_nil() {
            Ok(default)
        } else {
            self.to_integer(i)
        }
    }

    pub fn opt_float(&self, i: i32, default: f64) -> LuaResult<f64> {
        if self.get_slot(i)?.is_nil() {
            Ok(default)
        } else {
            self.to_float(i)
        }
    }

    // ---- tables (SPEC_FULL.md §4.6 "Tables") ------------------------------

    /// `GetTable`: pops a key off the top, pushes `t[key]` (metamethod-aware).
    pub fn get_table(&mut self, i: i32) -> LuaResult<()> {
        let table = self.get_slot(i)?;
        let key = self.pop();
        let v = metadispatch::index(self, table, key)?;
        self.push(v);
        Ok(())
    }

    /// `SetTable`: pops value then key (value was pushed last), sets
    /// `t[key] = value` (metamethod-aware).
    pub fn set_table(&mut self, i: i32) -> LuaResult<()> {
        let table = self.get_slot(i)?;
        let value = self.pop();
        let key = self.pop();
        metadispatch::newindex(self, table, key, value)
    }

    pub fn get_table_raw(&mut self, i: i32) -> LuaResult<()> {
        let table = self.get_slot(i)?;
        let key = self.pop();
        let v = match table {
            Value::Table(id) => self.table(id).raw_get(&key),
            _ => return Err(LuaError::type_error("GetTableRaw target is not a table")),
        };
        self.push(v);
        Ok(())
    }

    pub fn set_table_raw(&mut self, i: i32) -> LuaResult<()> {
        let table = self.get_slot(i)?;
        let value = self.pop();
        let key = self.pop();
        match table {
            Value::Table(id) => self.table_mut(id).raw_set(key, value),
            _ => Err(LuaError::type_error("SetTableRaw target is not a table")),
        }
    }

    /// `__len`-aware length, pushed as the result (SPEC_FULL.md §4.5).
    pub fn length(&mut self, i: i32) -> LuaResult<()> {
        let v = self.get_slot(i)?;
        let r = metadispatch::length(self, v)?;
        self.push(r);
        Ok(())
    }

    pub fn length_raw(&mut self, i: i32) -> LuaResult<()> {
        let v = self.get_slot(i)?;
        let r = match v {
            Value::String(id) => Value::Integer(self.strings().get(id).len() as i64),
            Value::Table(id) => Value::Integer(self.table(id).length()),
            _ => return Err(LuaError::type_error("attempt to get length of a non-string/table value")),
        };
        self.push(r);
        Ok(())
    }

    /// Pushes a callable iterator function for the value at `i`
    /// (SPEC_FULL.md §4.2 "Raw iterator"/"Respecting iterator"). Calling it
    /// repeatedly yields `(key, value)` pairs until `(nil, nil)`.
    pub fn get_iter(&mut self, i: i32) -> LuaResult<()> {
        let v = self.get_slot(i)?;
        if let Some(custom) = metadispatch::respecting_iterator(self, v)? {
            self.push(custom);
            return Ok(());
        }
        let id = match v {
            Value::Table(id) => id,
            _ => return Err(LuaError::type_error("GetIter target is not a table")),
        };
        let snapshot = IteratorSnapshot::new(self.table(id));
        let ud_id = self.new_userdata(Box::new(snapshot));
        self.push_closure(iterator_step, "next", vec![Value::Userdata(ud_id)]);
        Ok(())
    }

    /// Convenience host-side iteration respecting `__pairs` when present,
    /// falling back to the raw snapshot (SPEC_FULL.md §4.2 "ForEach").
    pub fn for_each<F>(&mut self, i: i32, mut f: F) -> LuaResult<()>
    where
        F: FnMut(&mut State, Value, Value) -> LuaResult<()>,
    {
        let v = self.get_slot(i)?;
        if let Some(iter_fn) = metadispatch::respecting_iterator(self, v)? {
            loop {
                let results = call_value(self, iter_fn, &[], 2)?;
                let key = results.first().copied().unwrap_or(Value::Nil);
                if key.is_nil() {
                    break;
                }
                let value = results.get(1).copied().unwrap_or(Value::Nil);
                f(self, key, value)?;
            }
            return Ok(());
        }
        self.for_each_raw(i, f)
    }

    /// Iterates the raw snapshot only, ignoring `__pairs` (SPEC_FULL.md
    /// §4.2 "ForEachRaw").
    pub fn for_each_raw<F>(&mut self, i: i32, mut f: F) -> LuaResult<()>
    where
        F: FnMut(&mut State, Value, Value) -> LuaResult<()>,
    {
        let id = match self.get_slot(i)? {
            Value::Table(id) => id,
            _ => return Err(LuaError::type_error("ForEachRaw target is not a table")),
        };
        let pairs = self.table(id).snapshot_pairs();
        for (k, v) in pairs {
            f(self, k, v)?;
        }
        Ok(())
    }

    // ---- metatables (SPEC_FULL.md §4.5, §4.6) -----------------------------

    /// Pushes the metatable for the value at `i`, or `nil` if it has none.
    /// Respects `__metatable` (SPEC_FULL.md §4.5 "introspection guard").
    pub fn get_metatable(&mut self, i: i32) -> LuaResult<()> {
        let v = self.get_slot(i)?;
        match self.metatable_for(v) {
            Some(id) => {
                let guarded = metadispatch::metatable_guard(self, id);
                self.push(guarded.unwrap_or(Value::Table(id)));
            }
            None => self.push(Value::Nil),
        }
        Ok(())
    }

    /// Pops a table (or nil) and sets it as the metatable of the value at
    /// `i`; rejected if the current metatable carries a `__metatable` guard.
    pub fn set_metatable(&mut self, i: i32) -> LuaResult<()> {
        let target = self.get_slot(i)?;
        let new_mt = self.pop();
        let new_mt_id = match new_mt {
            Value::Nil => None,
            Value::Table(id) => Some(id),
            _ => return Err(LuaError::type_error("metatable must be a table or nil")),
        };
        match target {
            Value::Table(id) => {
                if let Some(cur) = self.table(id).metatable() {
                    if metadispatch::metatable_guard(self, cur).is_some() {
                        return Err(LuaError::type_error("cannot change a protected metatable"));
                    }
                }
                self.table_mut(id).set_metatable(new_mt_id);
                Ok(())
            }
            Value::Userdata(id) => {
                if let Some(cur) = self.userdata(id).metatable {
                    if metadispatch::metatable_guard(self, cur).is_some() {
                        return Err(LuaError::type_error("cannot change a protected metatable"));
                    }
                }
                self.userdata_mut(id).metatable = new_mt_id;
                Ok(())
            }
            other => {
                self.set_default_metatable(other.type_of(), new_mt_id);
                Ok(())
            }
        }
    }

    /// Looks up one named field in the metatable of the value at `i`
    /// without going through the `__metatable` guard (the guard only hides
    /// the metatable object itself, not individual field reads).
    pub fn get_metafield(&mut self, i: i32, name: &str) -> LuaResult<bool> {
        let v = self.get_slot(i)?;
        let key = self.intern(name);
        match metadispatch::get_metamethod(self, v, key) {
            Some(field) => {
                self.push(field);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // ---- calls (SPEC_FULL.md §4.6 "Call"/"PCall") -------------------------

    /// Calls the function at `top - nargs - 1` with the `nargs` values above
    /// it. On failure the VM unwinds without restoring the stack — callers
    /// that need recovery should use `pcall` instead.
    pub fn call(&mut self, nargs: usize, nresults: i32) -> LuaResult<usize> {
        let func_index = self.top() - nargs - 1;
        do_call_at(self, func_index, nargs, nresults)
    }

    /// Protected call: on failure, restores the stack to its pre-call
    /// height, closes any upvalues that were open above the call, and
    /// returns a [`LuaFullError`] (with a traceback when `trace` is set).
    pub fn pcall(&mut self, nargs: usize, nresults: i32, trace: bool) -> PCallOutcome {
        let func_index = self.top() - nargs - 1;
        let frames_before = self.frames().len();
        self.clear_pending_trace();
        match do_call_at(self, func_index, nargs, nresults) {
            Ok(n) => PCallOutcome::Ok(n),
            Err(e) => {
                let trace_frames = self.take_pending_trace();
                let trace_frames = if trace { trace_frames } else { Vec::new() };
                let message = self.describe_error(&e);
                self.close_upvalues_from(func_index);
                self.truncate_frames(frames_before);
                self.truncate(func_index);
                PCallOutcome::Err(LuaFullError::new(&e, message, trace_frames))
            }
        }
    }

    /// Renders an error for display: `User` payloads go through
    /// `__tostring` since they may be arbitrary values, everything else
    /// already carries a plain message.
    pub fn describe_error(&mut self, err: &LuaError) -> String {
        match err {
            LuaError::User(v) => metadispatch::tostring(self, *v).unwrap_or_else(|_| "<error object>".to_string()),
            other => other.to_string(),
        }
    }

    // ---- Error() (SPEC_FULL.md §4.6) --------------------------------------

    /// Pops a value and turns it into a failure for a native function to
    /// return (`Err(state.raise())`).
    pub fn raise(&mut self) -> LuaError {
        let v = self.pop();
        LuaError::User(v)
    }

    // ---- loading/dumping (SPEC_FULL.md §4.6, §6, §10.5) -------------------

    pub fn load_binary(&mut self, bytes: &[u8], chunk_name: &str, env_index: i32) -> LuaResult<()> {
        let proto = crate::chunk::load_with_strings(bytes, chunk_name, &mut self.strings)?;
        self.push_lua_closure(Rc::new(proto), env_index)
    }

    pub fn load_text(&mut self, compiler: &dyn Compiler, source: &[u8], chunk_name: &str, env_index: i32) -> LuaResult<()> {
        let proto = compiler.compile(source, chunk_name)?;
        self.push_lua_closure(Rc::new(proto), env_index)
    }

    pub fn dump(&self, i: i32, strip: bool) -> LuaResult<Vec<u8>> {
        let v = self.get_slot(i)?;
        match v {
            Value::Function(fid) => match self.function(fid) {
                Function::Lua(lf) => Ok(crate::chunk::dump_with_strings(&lf.prototype, strip, &self.strings)),
                Function::Native(_) => Err(LuaError::type_error("cannot dump a native function")),
            },
            _ => Err(LuaError::type_error("Dump target is not a function")),
        }
    }

    /// Builds the top-level closure for a freshly loaded/compiled
    /// prototype, binding its sole implicit upvalue (`_ENV`, by the Lua
    /// 5.3 convention the teacher's own compiler front end follows) to
    /// `env_index`, or to the globals table when `env_index == 0`.
    fn push_lua_closure(&mut self, proto: Rc<Prototype>, env_index: i32) -> LuaResult<()> {
        let env = if env_index == 0 { self.globals_value() } else { self.get_slot(env_index)? };
        let mut ups = Vec::with_capacity(proto.upvalues.len());
        if !proto.upvalues.is_empty() {
            ups.push(self.new_closed_upvalue(env));
        }
        for _ in 1..proto.upvalues.len() {
            ups.push(self.new_closed_upvalue(Value::Nil));
        }
        let fid = self.new_lua_function(proto, ups);
        self.push(Value::Function(fid));
        Ok(())
    }

    /// Registers `loader` under `name` in the registry's `_PRELOAD` table
    /// (SPEC_FULL.md §4.6 "Preload"), mirroring `package.preload`.
    pub fn preload(&mut self, name: &str, loader: Value) -> LuaResult<()> {
        let preload_key = self.intern("_PRELOAD");
        let registry_id = self.registry_id();
        let existing = self.table(registry_id).raw_get(&Value::String(preload_key));
        let preload_table = match existing {
            Value::Table(id) => id,
            _ => {
                let id = self.new_table(0, 4);
                self.table_mut(registry_id).raw_set(Value::String(preload_key), Value::Table(id))?;
                id
            }
        };
        let name_key = self.intern(name);
        self.table_mut(preload_table).raw_set(Value::String(name_key), loader)
    }
}

/// The native function body behind every value `GetIter` pushes: reads its
/// own upvalue 2 (upvalue 1 is always the globals table `push_closure`
/// reserves for every native closure; the snapshot, stashed in a
/// `Userdata`, is the first upvalue supplied by the caller) and returns the
/// next pair, or `(nil, nil)` once exhausted.
fn iterator_step(state: &mut State) -> LuaResult<usize> {
    let ud_value = state.get_slot(crate::vm::upvalue_index(2))?;
    let id = match ud_value {
        Value::Userdata(id) => id,
        _ => return Err(LuaError::internal("iterator upvalue is not userdata")),
    };
    let (k, v) = next_pair(state, id)?;
    state.push(k);
    state.push(v);
    Ok(2)
}

fn next_pair(state: &mut State, id: UserdataId) -> LuaResult<(Value, Value)> {
    let ud = state.userdata_mut(id);
    let snapshot = ud
        .data
        .downcast_mut::<IteratorSnapshot>()
        .ok_or_else(|| LuaError::internal("iterator userdata has the wrong type"))?;
    Ok(snapshot.next_pair())
}
