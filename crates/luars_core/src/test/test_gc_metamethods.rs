//! `__index`/`__newindex` metamethod dispatch and mark-and-sweep
//! reclamation, all driven through the Host API (`metadispatch` itself is
//! private to `vm` and not reachable from here).

use crate::error::{LuaError, LuaResult};
use crate::value::Value;
use crate::vm::State;

/// `__index` as a function: `t[k]` falls through to `mt.__index(t, k)`
/// whenever `t` has no raw entry for `k`.
fn index_dup(state: &mut State) -> LuaResult<usize> {
    let key = state.get_slot(2)?;
    let s = match key {
        Value::String(id) => state.strings().get(id).to_string(),
        _ => return Err(LuaError::type_error("key is not a string")),
    };
    let doubled = format!("{}{}", s, s);
    state.push_string(&doubled);
    Ok(1)
}

#[test]
fn index_metamethod_function_is_called_on_miss() {
    let mut state = State::new();

    state.push_new_table(0, 1);
    let mt_index = state.top() as i32 - 1;
    state.push_string("__index");
    state.push_closure(index_dup, "index_dup", vec![]);
    state.set_table_raw(mt_index).unwrap();

    state.push_new_table(0, 0);
    let t_index = state.top() as i32 - 1;
    state.push_index(mt_index).unwrap();
    state.set_metatable(t_index).unwrap();

    state.push_string("ab");
    state.get_table(t_index).unwrap();
    let result = state.pop();
    match result {
        Value::String(id) => assert_eq!(state.strings().get(id), "abab"),
        other => panic!("expected a string, got {:?}", other),
    }
}

/// `__newindex` as a table: `t[k] = v` on a miss redirects the write into
/// the `__newindex` table instead of `t` itself.
#[test]
fn newindex_metamethod_table_redirects_write() {
    let mut state = State::new();

    state.push_new_table(0, 0);
    let store_index = state.top() as i32 - 1;
    let store = state.get_slot(store_index).unwrap();

    state.push_new_table(0, 1);
    let mt_index = state.top() as i32 - 1;
    state.push_string("__newindex");
    state.push_index(store_index).unwrap();
    state.set_table_raw(mt_index).unwrap();

    state.push_new_table(0, 0);
    let t_index = state.top() as i32 - 1;
    state.push_index(mt_index).unwrap();
    state.set_metatable(t_index).unwrap();

    state.push_string("k");
    state.push_integer(7);
    state.set_table(t_index).unwrap();

    // the write landed in `store`, not `t`.
    match store {
        Value::Table(id) => {
            let v = state.table(id).raw_get(&Value::String(state.intern("k")));
            assert!(matches!(v, Value::Integer(7)));
        }
        _ => unreachable!(),
    }
    state.push_string("k");
    state.get_table_raw(t_index).unwrap();
    assert!(matches!(state.pop(), Value::Nil));
}

/// Once a table is unreachable from every GC root (globals, registry,
/// stack, open upvalues), `collect_garbage` must actually reclaim its
/// arena slot.
#[test]
fn collect_garbage_reclaims_unreachable_table() {
    let mut state = State::new();
    let id = state.new_table(0, 0);
    assert!(state.tables.get(id.0).is_some());

    state.collect_garbage();
    assert!(state.tables.get(id.0).is_none(), "unreachable table survived a collection");
}

/// A table reachable through globals survives collection.
#[test]
fn collect_garbage_keeps_reachable_table() {
    let mut state = State::new();
    let id = state.new_table(0, 0);
    let key = state.intern("kept");
    let globals_id = state.globals_id();
    state.table_mut(globals_id).raw_set(Value::String(key), Value::Table(id)).unwrap();

    state.collect_garbage();
    assert!(state.tables.get(id.0).is_some());
}
