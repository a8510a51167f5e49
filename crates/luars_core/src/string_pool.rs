//! String interning.
//!
//! Every Lua string value observed by the VM is interned here exactly
//! once; `Value::String` only ever stores the resulting `StringId`, which
//! is why raw string equality in `value.rs` can compare ids instead of
//! bytes.

use smol_str::SmolStr;

use crate::gc::Arena;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(transparent)]
pub struct StringId(pub(crate) u32);

impl StringId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

pub struct StringPool {
    arena: Arena<SmolStr>,
    index: hashbrown::HashMap<SmolStr, StringId, ahash::RandomState>,
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringPool {
    pub fn new() -> Self {
        StringPool {
            arena: Arena::new(),
            index: hashbrown::HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Intern `s`, returning the existing id if this exact byte sequence
    /// has been interned before.
    pub fn intern(&mut self, s: &str) -> StringId {
        if let Some(id) = self.index.get(s) {
            return *id;
        }
        let smol: SmolStr = s.into();
        let raw = self.arena.insert(smol.clone());
        let id = StringId(raw);
        self.index.insert(smol, id);
        id
    }

    pub fn get(&self, id: StringId) -> &str {
        self.arena
            .get(id.0)
            .map(|s| s.as_str())
            .unwrap_or_else(|| panic!("dangling StringId {:?} (use-after-collect)", id))
    }

    pub fn live_indices(&self) -> impl Iterator<Item = u32> + '_ {
        self.arena.live_indices()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Drop any interned string whose index is not in `marked`, and remove
    /// it from the lookup table so a later `intern` of the same bytes
    /// re-allocates rather than returning the stale id. Called by
    /// `State::collect_garbage` after the mark phase.
    pub fn sweep(&mut self, marked: &hashbrown::HashSet<u32>) {
        let dead: Vec<SmolStr> = self
            .arena
            .live_indices()
            .filter(|i| !marked.contains(i))
            .filter_map(|i| self.arena.get(i).cloned())
            .collect();
        for s in &dead {
            self.index.remove(s);
        }
        self.arena.sweep(marked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups_equal_bytes() {
        let mut pool = StringPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("hello");
        assert_eq!(a, b);
        let c = pool.intern("world");
        assert_ne!(a, c);
    }

    #[test]
    fn get_roundtrips_content() {
        let mut pool = StringPool::new();
        let id = pool.intern("abc");
        assert_eq!(pool.get(id), "abc");
    }
}
