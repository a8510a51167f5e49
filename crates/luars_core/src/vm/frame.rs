//! Call frames (SPEC_FULL.md §3 "Stack", §4.3 "Frame lifecycle").
//!
//! Grounded in the teacher's `lua_vm/lua_call_frame.rs` for the field list
//! and naming (`base_ptr`/`top`/`pc`/`vararg_start`/`vararg_count`/
//! `callstatus`), but that struct is built around raw pointers into the
//! instruction/constant arrays for a hot-path optimization this core does
//! not attempt to reproduce without being able to compile and benchmark
//! it; `Frame` below is a plain, safely-indexed record instead (the
//! prototype is reached through `Rc<Prototype>` on the `Function`, looked
//! up by id each time rather than cached as a raw pointer).

use crate::function::Upvalue;
use crate::gc::UpvalueId;
use crate::value::Value;

/// Call-status flags, mirroring the teacher's `CIST_LUA`/`CIST_TAIL`
/// (`lua_vm/lua_call_frame.rs`) as plain `u8` bits rather than pulling in
/// the `bitflags` crate for two flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallStatus(pub u8);

impl CallStatus {
    pub const LUA: CallStatus = CallStatus(1 << 0);
    pub const TAIL: CallStatus = CallStatus(1 << 1);

    pub fn contains(self, other: CallStatus) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CallStatus) {
        self.0 |= other.0;
    }
}

/// One call activation (SPEC_FULL.md §3 "Stack"). Lua frames carry a `pc`
/// into their prototype's instruction stream; native frames don't (the
/// native callback runs to completion synchronously, so there's no pc to
/// resume).
pub struct Frame {
    /// The callee, so tracebacks and `debug`-style introspection can name it.
    pub function: Value,
    /// Absolute stack index of the function value itself.
    pub func_index: usize,
    /// Absolute stack index of the first argument/register.
    pub base: usize,
    pub arg_count: usize,
    /// Declared by the caller; `-1` means "all results" (`LUA_MULTRET`).
    pub expected_results: i32,
    pub pc: usize,
    /// Open upvalue cells referring into this frame's stack range, kept
    /// sorted by descending stack index (SPEC_FULL.md §4.3).
    pub open_upvalues: Vec<UpvalueId>,
    /// Absolute index where the caller wants this call's results placed.
    pub result_base: usize,
    pub status: CallStatus,
    pub vararg_base: usize,
    pub vararg_count: usize,
}

impl Frame {
    pub fn new_lua(
        function: Value,
        func_index: usize,
        base: usize,
        arg_count: usize,
        expected_results: i32,
        result_base: usize,
    ) -> Self {
        Frame {
            function,
            func_index,
            base,
            arg_count,
            expected_results,
            pc: 0,
            open_upvalues: Vec::new(),
            result_base,
            status: CallStatus::LUA,
            vararg_base: 0,
            vararg_count: 0,
        }
    }

    pub fn new_native(function: Value, func_index: usize, base: usize, arg_count: usize) -> Self {
        Frame {
            function,
            func_index,
            base,
            arg_count,
            expected_results: -1,
            pc: 0,
            open_upvalues: Vec::new(),
            result_base: base,
            status: CallStatus::default(),
            vararg_base: 0,
            vararg_count: 0,
        }
    }

    pub fn is_lua(&self) -> bool {
        self.status.contains(CallStatus::LUA)
    }

    pub fn is_tailcall(&self) -> bool {
        self.status.contains(CallStatus::TAIL)
    }

    pub fn set_vararg(&mut self, base: usize, count: usize) {
        self.vararg_base = base;
        self.vararg_count = count;
    }

    /// Insert `id` keeping the list sorted by descending `stack_index`,
    /// per SPEC_FULL.md §4.3. `upvalues` is passed in so we can read each
    /// cell's current stack index (it's only meaningful while open).
    pub fn insert_open_upvalue(&mut self, id: UpvalueId, upvalues: &crate::gc::Arena<Upvalue>) {
        let idx = upvalues
            .get(id.0)
            .and_then(|uv| uv.open_index())
            .unwrap_or(0);
        let pos = self
            .open_upvalues
            .iter()
            .position(|existing| {
                upvalues
                    .get(existing.0)
                    .and_then(|uv| uv.open_index())
                    .unwrap_or(0)
                    < idx
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, id);
    }
}
