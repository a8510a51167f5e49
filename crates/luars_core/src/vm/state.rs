//! `State`: the root object owning every arena, the value stack, the call
//! frames, globals/registry, and per-type default metatables (SPEC_FULL.md
//! §3 "Registry and globals", §9 "Cyclic structures" decision (b): manual
//! arena + explicit mark-and-sweep).
//!
//! Grounded in the teacher's `lua_vm/lua_state.rs` for the overall
//! responsibility (one big struct gating stack/frame/arena access behind
//! methods) and `lua_vm/safe_option.rs` for the options-struct shape
//! (`SafeOption` → `StateOptions` here, SPEC_FULL.md §10.7).

use std::any::Any;

use crate::error::{LuaError, LuaResult, TraceFrame};
use crate::function::{Function, LuaFunction, NativeFn, NativeFunction, Prototype, Upvalue, UpvalueState};
use crate::gc::{Arena, FunctionId, GcMarks, TableId, UpvalueId, UserdataId};
use crate::string_pool::{StringId, StringPool};
use crate::table::Table;
use crate::value::{Value, ValueType};
use crate::vm::frame::Frame;
use crate::vm::metadispatch::MetaNames;
use std::rc::Rc;

/// Options controlling a `State`'s initial capacity and GC policy
/// (SPEC_FULL.md §10.7). There is no config-file parsing here, in keeping
/// with the teacher's own `SafeOption` being a plain builder struct, not a
/// parsed external format.
#[derive(Debug, Clone)]
pub struct StateOptions {
    pub initial_stack_capacity: usize,
    pub string_intern_capacity: usize,
    /// `Some(n)`: `collect_garbage` runs automatically once the running
    /// count of arena allocations since the last collection reaches `n`.
    /// `None`: collection only ever happens when the host calls
    /// `collect_garbage` directly (SPEC_FULL.md §9's "invoked by the host,
    /// never implicitly" framing is the default).
    pub auto_gc_debt_threshold: Option<usize>,
}

impl Default for StateOptions {
    fn default() -> Self {
        StateOptions {
            initial_stack_capacity: 256,
            string_intern_capacity: 256,
            auto_gc_debt_threshold: None,
        }
    }
}

/// An opaque host value (SPEC_FULL.md §3 "Function" userdata arm, §4.6
/// "Push primitives ... arbitrary host value as userdata"). Carries its own
/// metatable slot directly (unlike tables there's no single shared
/// "userdata" partition structure to hang it off).
pub struct Userdata {
    pub data: Box<dyn Any>,
    pub metatable: Option<TableId>,
}

/// Resolved form of a Host API stack index (SPEC_FULL.md §4.3
/// "Addressing").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedIndex {
    Stack(usize),
    Registry,
    Globals,
    Upvalue(u32),
}

pub struct State {
    pub(crate) strings: StringPool,
    pub(crate) tables: Arena<Table>,
    pub(crate) functions: Arena<Function>,
    pub(crate) upvalues: Arena<Upvalue>,
    pub(crate) userdata: Arena<Userdata>,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) globals: TableId,
    pub(crate) registry: TableId,
    pub(crate) default_metatables: [Option<TableId>; ValueType::COUNT],
    pub(crate) options: StateOptions,
    meta_names: MetaNames,
    alloc_debt: usize,
    /// Trace frames noted by the interpreter as a Lua/native call frame
    /// unwinds past an error (SPEC_FULL.md §7 "Diagnostics"). Drained by
    /// `PCall` when it catches the error; stale entries from a call that
    /// never gets caught just sit here until the next `PCall` drains them.
    pending_trace: Vec<TraceFrame>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    pub fn new() -> Self {
        Self::with_options(StateOptions::default())
    }

    pub fn with_options(options: StateOptions) -> Self {
        let mut tables = Arena::new();
        let globals_raw = tables.insert(Table::new());
        let registry_raw = tables.insert(Table::new());
        let globals = TableId(globals_raw);
        let registry = TableId(registry_raw);

        let mut strings = StringPool::new();
        let g_key = strings.intern("_G");
        // `_G._G == _G` (SPEC_FULL.md §3 "preinstalled with `_G -> self`").
        tables
            .get_mut(globals_raw)
            .expect("just inserted")
            .raw_set(Value::String(g_key), Value::Table(globals))
            .expect("string key is never nil/NaN");
        let meta_names = MetaNames::new(&mut strings);

        State {
            strings,
            tables,
            functions: Arena::new(),
            upvalues: Arena::new(),
            userdata: Arena::new(),
            stack: Vec::with_capacity(options.initial_stack_capacity),
            frames: Vec::new(),
            globals,
            registry,
            default_metatables: [None; ValueType::COUNT],
            options,
            meta_names,
            alloc_debt: 0,
            pending_trace: Vec::new(),
        }
    }

    /// Interned metamethod names (SPEC_FULL.md §4.5), looked up once at
    /// construction so metatable dispatch never needs a `&mut StringPool`.
    pub fn meta_names(&self) -> MetaNames {
        self.meta_names
    }

    // ---- identity accessors ------------------------------------------

    pub fn globals_id(&self) -> TableId {
        self.globals
    }

    pub fn registry_id(&self) -> TableId {
        self.registry
    }

    pub fn globals_value(&self) -> Value {
        Value::Table(self.globals)
    }

    pub fn registry_value(&self) -> Value {
        Value::Table(self.registry)
    }

    // ---- arena access --------------------------------------------------

    pub fn strings(&self) -> &StringPool {
        &self.strings
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        let id = self.strings.intern(s);
        self.bump_debt();
        id
    }

    pub fn table(&self, id: TableId) -> &Table {
        self.tables
            .get(id.0)
            .unwrap_or_else(|| panic!("dangling {:?}", id))
    }

    pub fn table_mut(&mut self, id: TableId) -> &mut Table {
        self.tables
            .get_mut(id.0)
            .unwrap_or_else(|| panic!("dangling TableId"))
    }

    pub fn new_table(&mut self, array_hint: usize, hash_hint: usize) -> TableId {
        let id = TableId(self.tables.insert(Table::with_size_hints(array_hint, hash_hint)));
        self.bump_debt();
        id
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        self.functions
            .get(id.0)
            .unwrap_or_else(|| panic!("dangling {:?}", id))
    }

    pub fn new_lua_function(&mut self, prototype: Rc<Prototype>, upvalues: Vec<UpvalueId>) -> FunctionId {
        let id = FunctionId(self.functions.insert(Function::Lua(LuaFunction { prototype, upvalues })));
        self.bump_debt();
        id
    }

    pub fn new_native_function(&mut self, callback: NativeFn, upvalues: Vec<Value>, name: &'static str) -> FunctionId {
        let id = FunctionId(
            self.functions
                .insert(Function::Native(NativeFunction { callback, upvalues, name })),
        );
        self.bump_debt();
        id
    }

    pub fn upvalue(&self, id: UpvalueId) -> &Upvalue {
        self.upvalues
            .get(id.0)
            .unwrap_or_else(|| panic!("dangling {:?}", id))
    }

    pub fn upvalue_mut(&mut self, id: UpvalueId) -> &mut Upvalue {
        self.upvalues
            .get_mut(id.0)
            .unwrap_or_else(|| panic!("dangling UpvalueId"))
    }

    pub fn new_open_upvalue(&mut self, stack_index: usize) -> UpvalueId {
        let id = UpvalueId(self.upvalues.insert(Upvalue::new_open(stack_index)));
        self.bump_debt();
        id
    }

    pub fn new_closed_upvalue(&mut self, value: Value) -> UpvalueId {
        let id = UpvalueId(self.upvalues.insert(Upvalue {
            state: UpvalueState::Closed(value),
        }));
        self.bump_debt();
        id
    }

    pub fn userdata(&self, id: UserdataId) -> &Userdata {
        self.userdata
            .get(id.0)
            .unwrap_or_else(|| panic!("dangling {:?}", id))
    }

    pub fn userdata_mut(&mut self, id: UserdataId) -> &mut Userdata {
        self.userdata
            .get_mut(id.0)
            .unwrap_or_else(|| panic!("dangling UserdataId"))
    }

    pub fn new_userdata(&mut self, data: Box<dyn Any>) -> UserdataId {
        let id = UserdataId(self.userdata.insert(Userdata { data, metatable: None }));
        self.bump_debt();
        id
    }

    // ---- default metatables --------------------------------------------

    pub fn default_metatable(&self, ty: ValueType) -> Option<TableId> {
        self.default_metatables[ty.as_index()]
    }

    pub fn set_default_metatable(&mut self, ty: ValueType, mt: Option<TableId>) {
        self.default_metatables[ty.as_index()] = mt;
    }

    /// The metatable consulted for `v`'s type (SPEC_FULL.md §4.5): the
    /// object's own metatable for tables/userdata, else the shared
    /// per-type default.
    pub fn metatable_for(&self, v: Value) -> Option<TableId> {
        match v {
            Value::Table(id) => self.table(id).metatable().or_else(|| self.default_metatable(ValueType::Table)),
            Value::Userdata(id) => self
                .userdata(id)
                .metatable
                .or_else(|| self.default_metatable(ValueType::Userdata)),
            other => self.default_metatable(other.type_of()),
        }
    }

    // ---- stack ----------------------------------------------------------

    pub fn top(&self) -> usize {
        self.stack.len()
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn current_base(&self) -> usize {
        self.frames.last().map(|f| f.base).unwrap_or(0)
    }

    pub fn current_frame(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub(crate) fn push_frame(&mut self, f: Frame) {
        self.frames.push(f);
    }

    pub(crate) fn pop_frame(&mut self) -> Frame {
        self.frames.pop().expect("pop_frame called with no active frame")
    }

    pub(crate) fn frame_mut_at(&mut self, idx: usize) -> &mut Frame {
        &mut self.frames[idx]
    }

    pub(crate) fn truncate_frames(&mut self, len: usize) {
        self.frames.truncate(len);
    }

    pub fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Nil)
    }

    pub fn truncate(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    pub fn ensure_len(&mut self, len: usize) {
        if self.stack.len() < len {
            self.stack.resize(len, Value::Nil);
        }
    }

    /// Absolute-index register access used by the interpreter loop
    /// (`vm::interpreter`), which already knows the frame's `base` and
    /// never needs pseudo-index resolution.
    pub(crate) fn abs_get(&self, idx: usize) -> Value {
        self.stack.get(idx).copied().unwrap_or(Value::Nil)
    }

    pub(crate) fn abs_set(&mut self, idx: usize, v: Value) {
        self.ensure_len(idx + 1);
        self.stack[idx] = v;
    }

    pub(crate) fn insert_at(&mut self, idx: usize, v: Value) {
        self.stack.insert(idx, v);
    }

    /// SPEC_FULL.md §4.3 "Addressing": translate any positive/negative/
    /// pseudo index into a `ResolvedIndex`.
    pub fn resolve_index(&self, i: i32) -> LuaResult<ResolvedIndex> {
        if i == super::REGISTRY_INDEX {
            return Ok(ResolvedIndex::Registry);
        }
        if i == super::GLOBALS_INDEX {
            return Ok(ResolvedIndex::Globals);
        }
        if let Some(u) = super::upvalue_index_arg(i) {
            return Ok(ResolvedIndex::Upvalue(u));
        }
        if i == 0 {
            return Err(LuaError::internal("stack index 0 is invalid"));
        }
        if i > 0 {
            Ok(ResolvedIndex::Stack(self.current_base() + (i as usize - 1)))
        } else {
            let top = self.stack.len() as i64;
            let idx = top + i as i64;
            if idx < 0 {
                Err(LuaError::internal("stack index out of range"))
            } else {
                Ok(ResolvedIndex::Stack(idx as usize))
            }
        }
    }

    /// SPEC_FULL.md §4.6 `AbsIndex`: any form converts to a positive
    /// (frame-relative) index; pseudo-indices pass through unchanged.
    pub fn abs_index(&self, i: i32) -> LuaResult<i32> {
        match self.resolve_index(i)? {
            ResolvedIndex::Stack(abs) => Ok((abs - self.current_base() + 1) as i32),
            ResolvedIndex::Registry => Ok(super::REGISTRY_INDEX),
            ResolvedIndex::Globals => Ok(super::GLOBALS_INDEX),
            ResolvedIndex::Upvalue(u) => Ok(super::upvalue_index(u)),
        }
    }

    /// Current native frame's captured upvalues, if the top frame is native.
    fn current_native_upvalues(&self) -> Option<&[Value]> {
        let frame = self.frames.last()?;
        if let Value::Function(fid) = frame.function {
            if let Function::Native(nf) = self.function(fid) {
                return Some(&nf.upvalues);
            }
        }
        None
    }

    pub fn get_slot(&self, i: i32) -> LuaResult<Value> {
        match self.resolve_index(i)? {
            ResolvedIndex::Stack(abs) => Ok(self.stack.get(abs).copied().unwrap_or(Value::Nil)),
            ResolvedIndex::Registry => Ok(self.registry_value()),
            ResolvedIndex::Globals => Ok(self.globals_value()),
            ResolvedIndex::Upvalue(u) => {
                let ups = self
                    .current_native_upvalues()
                    .ok_or_else(|| LuaError::internal("upvalue pseudo-index outside a native frame"))?;
                Ok(ups.get(u as usize - 1).copied().unwrap_or(Value::Nil))
            }
        }
    }

    pub fn set_slot(&mut self, i: i32, value: Value) -> LuaResult<()> {
        match self.resolve_index(i)? {
            ResolvedIndex::Stack(abs) => {
                self.ensure_len(abs + 1);
                self.stack[abs] = value;
                Ok(())
            }
            ResolvedIndex::Registry | ResolvedIndex::Globals => {
                Err(LuaError::internal("cannot overwrite the registry/globals pseudo-slot"))
            }
            ResolvedIndex::Upvalue(u) => {
                let frame = self.frames.last().ok_or_else(|| LuaError::internal("no current frame"))?;
                let fid = match frame.function {
                    Value::Function(fid) => fid,
                    _ => return Err(LuaError::internal("current frame has no function")),
                };
                match self.functions.get_mut(fid.0) {
                    Some(Function::Native(nf)) => {
                        let idx = u as usize - 1;
                        if idx >= nf.upvalues.len() {
                            return Err(LuaError::internal("upvalue index out of range"));
                        }
                        nf.upvalues[idx] = value;
                        Ok(())
                    }
                    _ => Err(LuaError::internal("upvalue pseudo-index outside a native frame")),
                }
            }
        }
    }

    /// Close every open upvalue of the current frame whose stack index is
    /// `>= from` (SPEC_FULL.md §4.3 "closing"): copy the stack value into
    /// the cell and detach it from the stack. Used on block exit (`JMP`
    /// with a close flag), `RETURN`, and `TAILCALL`.
    pub(crate) fn close_upvalues_from(&mut self, from: usize) {
        let frame = match self.frames.last_mut() {
            Some(f) => f,
            None => return,
        };
        let (closing, remaining): (Vec<UpvalueId>, Vec<UpvalueId>) = frame
            .open_upvalues
            .iter()
            .copied()
            .partition(|id| self.upvalues.get(id.0).and_then(|uv| uv.open_index()).unwrap_or(0) >= from);
        frame.open_upvalues = remaining;
        for id in closing {
            let value = self.stack.get(
                self.upvalues.get(id.0).and_then(|uv| uv.open_index()).unwrap_or(0),
            ).copied().unwrap_or(Value::Nil);
            if let Some(uv) = self.upvalues.get_mut(id.0) {
                uv.close(value);
            }
        }
    }

    /// Find (or create) the open upvalue cell at absolute stack index
    /// `index`, for `CLOSURE`'s "capture a local" case (SPEC_FULL.md
    /// §4.4 "Closure construction").
    pub(crate) fn find_or_create_open_upvalue(&mut self, index: usize) -> UpvalueId {
        if let Some(frame) = self.frames.last() {
            for id in &frame.open_upvalues {
                if self.upvalues.get(id.0).and_then(|uv| uv.open_index()) == Some(index) {
                    return *id;
                }
            }
        }
        let id = UpvalueId(self.upvalues.insert(Upvalue::new_open(index)));
        if let Some(frame) = self.frames.last_mut() {
            let arena = &self.upvalues;
            frame.insert_open_upvalue(id, arena);
        }
        self.bump_debt();
        id
    }

    // ---- error tracebacks ------------------------------------------------

    pub(crate) fn note_unwinding_frame(&mut self, frame: TraceFrame) {
        self.pending_trace.push(frame);
    }

    pub(crate) fn take_pending_trace(&mut self) -> Vec<TraceFrame> {
        std::mem::take(&mut self.pending_trace)
    }

    pub(crate) fn clear_pending_trace(&mut self) {
        self.pending_trace.clear();
    }

    // ---- garbage collection --------------------------------------------

    fn bump_debt(&mut self) {
        if let Some(threshold) = self.options.auto_gc_debt_threshold {
            self.alloc_debt += 1;
            if self.alloc_debt >= threshold {
                self.collect_garbage();
            }
        }
    }

    fn mark_value(v: Value, marks: &mut GcMarks, worklist: &mut Vec<Value>) {
        match v {
            Value::String(id) => {
                marks.mark_string(id);
            }
            Value::Table(_) | Value::Function(_) | Value::Userdata(_) => {
                let is_new = match v {
                    Value::Table(id) => marks.mark_table(id),
                    Value::Function(id) => marks.mark_function(id),
                    Value::Userdata(id) => marks.mark_userdata(id),
                    _ => unreachable!(),
                };
                if is_new {
                    worklist.push(v);
                }
            }
            Value::Nil | Value::Boolean(_) | Value::Integer(_) | Value::Float(_) => {}
        }
    }

    /// Explicit mark-and-sweep, rooted at globals, registry, the live
    /// stack, open upvalues, and default metatables (SPEC_FULL.md §9
    /// "Cyclic structures" decision). Never run implicitly unless
    /// `StateOptions::auto_gc_debt_threshold` opts in.
    pub fn collect_garbage(&mut self) {
        let mut marks = GcMarks::default();
        let mut worklist = Vec::new();

        Self::mark_value(Value::Table(self.globals), &mut marks, &mut worklist);
        Self::mark_value(Value::Table(self.registry), &mut marks, &mut worklist);
        for mt in self.default_metatables.iter().flatten() {
            Self::mark_value(Value::Table(*mt), &mut marks, &mut worklist);
        }
        for v in &self.stack {
            Self::mark_value(*v, &mut marks, &mut worklist);
        }
        for frame in &self.frames {
            Self::mark_value(frame.function, &mut marks, &mut worklist);
            for uv_id in &frame.open_upvalues {
                if marks.mark_upvalue(*uv_id) {
                    // the open slot's value is already on the stack and
                    // thus already marked; nothing further to trace.
                }
            }
        }

        while let Some(v) = worklist.pop() {
            match v {
                Value::Table(id) => {
                    if let Some(t) = self.tables.get(id.0) {
                        if let Some(mt) = t.metatable() {
                            Self::mark_value(Value::Table(mt), &mut marks, &mut worklist);
                        }
                        let children: Vec<Value> = t.trace_children().collect();
                        for child in children {
                            Self::mark_value(child, &mut marks, &mut worklist);
                        }
                    }
                }
                Value::Function(id) => match self.functions.get(id.0) {
                    Some(Function::Lua(f)) => {
                        for uv_id in &f.upvalues {
                            let newly = marks.mark_upvalue(*uv_id);
                            if newly {
                                if let Some(uv) = self.upvalues.get(uv_id.0) {
                                    if let UpvalueState::Closed(val) = uv.state {
                                        Self::mark_value(val, &mut marks, &mut worklist);
                                    }
                                }
                            }
                        }
                        for c in &f.prototype.constants {
                            Self::mark_value(*c, &mut marks, &mut worklist);
                        }
                    }
                    Some(Function::Native(nf)) => {
                        let ups = nf.upvalues.clone();
                        for uv in ups {
                            Self::mark_value(uv, &mut marks, &mut worklist);
                        }
                    }
                    None => {}
                },
                Value::Userdata(id) => {
                    if let Some(u) = self.userdata.get(id.0) {
                        if let Some(mt) = u.metatable {
                            Self::mark_value(Value::Table(mt), &mut marks, &mut worklist);
                        }
                    }
                }
                _ => {}
            }
        }

        self.strings.sweep(&marks.strings);
        self.tables.sweep(&marks.tables);
        self.functions.sweep(&marks.functions);
        self.upvalues.sweep(&marks.upvalues);
        self.userdata.sweep(&marks.userdata);
        self.alloc_debt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_state_has_g_pointing_to_globals() {
        let s = State::new();
        let g_key = s.strings().get(StringId(0));
        assert_eq!(g_key, "_G");
        let v = s.table(s.globals_id()).raw_get(&Value::String(StringId(0)));
        assert!(matches!(v, Value::Table(id) if id == s.globals_id()));
    }

    #[test]
    fn resolve_index_positive_and_negative() {
        let mut s = State::new();
        s.push(Value::Integer(1));
        s.push(Value::Integer(2));
        s.push(Value::Integer(3));
        assert_eq!(s.resolve_index(1).unwrap(), ResolvedIndex::Stack(0));
        assert_eq!(s.resolve_index(-1).unwrap(), ResolvedIndex::Stack(2));
    }

    #[test]
    fn collect_garbage_frees_unreachable_table() {
        let mut s = State::new();
        let t = s.new_table(0, 0);
        assert!(s.tables.get(t.0).is_some());
        s.collect_garbage();
        assert!(s.tables.get(t.0).is_none());
    }

    #[test]
    fn collect_garbage_keeps_table_reachable_from_globals() {
        let mut s = State::new();
        let t = s.new_table(0, 0);
        let key = s.intern("k");
        s.table_mut(s.globals_id())
            .raw_set(Value::String(key), Value::Table(t))
            .unwrap();
        s.collect_garbage();
        assert!(s.tables.get(t.0).is_some());
    }

    #[test]
    fn collect_garbage_survives_a_table_closure_cycle() {
        let mut s = State::new();
        let t = s.new_table(0, 0);
        let proto = Rc::new(Prototype {
            source_name: "=test".into(),
            line_defined: 0,
            last_line_defined: 0,
            param_count: 0,
            is_vararg: false,
            max_stack_size: 2,
            instructions: vec![],
            constants: vec![],
            upvalues: vec![],
            protos: vec![],
            line_info: vec![],
        });
        let uv = s.new_closed_upvalue(Value::Nil);
        let f = s.new_lua_function(proto, vec![uv]);
        // table holds the closure, closure's upvalue holds the table: a cycle.
        let key = s.intern("f");
        s.table_mut(t).raw_set(Value::String(key), Value::Function(f)).unwrap();
        *match &mut s.upvalue_mut(uv).state {
            UpvalueState::Closed(v) => v,
            UpvalueState::Open(_) => unreachable!(),
        } = Value::Table(t);
        // keep it alive only via a stack reference to the table, the cycle is unreachable otherwise
        s.push(Value::Table(t));
        s.collect_garbage();
        assert!(s.tables.get(t.0).is_some());
        assert!(s.functions.get(f.0).is_some());
        // drop the stack reference; now the whole cycle is unreachable.
        s.truncate(0);
        s.collect_garbage();
        assert!(s.tables.get(t.0).is_none());
        assert!(s.functions.get(f.0).is_none());
    }
}
