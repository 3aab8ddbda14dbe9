//! String literal resolution
//!
//! `ldstr` tokens (`0x70` table) resolve through the loader's
//! user-string heap and intern per `(assembly, token)`; the returned
//! address is stable for the process lifetime.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::metadata::token::{TableId, Token};
use crate::resolve::Runtime;

/// Interned user strings.
pub struct StringRegistry {
    interned: RwLock<FxHashMap<(u32, u32), &'static str>>,
}

impl StringRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        StringRegistry { interned: RwLock::new(FxHashMap::default()) }
    }

    fn get(&self, assembly: u32, token: Token) -> Option<&'static str> {
        self.interned.read().get(&(assembly, token.raw())).copied()
    }

    fn intern(&self, assembly: u32, token: Token, value: String) -> &'static str {
        let mut interned = self.interned.write();
        interned
            .entry((assembly, token.raw()))
            .or_insert_with(|| Box::leak(value.into_boxed_str()))
    }

    /// Number of interned strings.
    pub fn len(&self) -> usize {
        self.interned.read().len()
    }

    /// Whether nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.interned.read().is_empty()
    }
}

impl Default for StringRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Resolve a user-string token to its interned contents.
    pub fn resolve_string(&self, token: Token) -> Option<&'static str> {
        if token.table()? != TableId::UserString {
            return None;
        }
        let assembly = self.current_assembly();
        if let Some(interned) = self.strings.get(assembly, token) {
            return Some(interned);
        }
        let value = self.provider.user_string(assembly, token)?;
        Some(self.strings.intern(assembly, token, value))
    }
}
