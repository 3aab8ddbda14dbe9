//! Static constructor ordering
//!
//! Each `(type, type-arg-hash)` with a `.cctor` owns one word-sized
//! context cell: non-zero holds the compiled cctor's address (pending),
//! zero means ran-or-running. The cell is registered *before* the cctor
//! compiles, which terminates the recursive resolution that occurs when
//! the cctor's own body touches the type's statics. The emitted
//! `CheckStaticClassConstruction` helper consumes the cell and zeroes it
//! at most once.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::context;
use crate::metadata::flags::MethodAttributes;
use crate::metadata::token::Token;
use crate::resolve::Runtime;

/// The one-word cctor state cell.
///
/// Values: the pending cctor's code address, or zero once the cctor has
/// run (or is running on this call chain).
pub struct CctorCell(AtomicUsize);

impl CctorCell {
    fn new() -> Self {
        CctorCell(AtomicUsize::new(0))
    }

    /// Pending cctor address; zero when ran or running.
    pub fn pending(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Claim the cctor for execution: returns the pending address and
    /// zeroes the cell, exactly once. Later callers get zero.
    pub fn take(&self) -> usize {
        self.0.swap(0, Ordering::AcqRel)
    }

    /// Address of the cell itself, for emitted guard sequences.
    pub fn address(&self) -> usize {
        &self.0 as *const AtomicUsize as usize
    }

    fn arm(&self, cctor_code: usize) {
        self.0.store(cctor_code, Ordering::Release);
    }
}

/// Registry of cctor context cells.
pub struct CctorRegistry {
    cells: RwLock<FxHashMap<(u32, u32, u32), &'static CctorCell>>,
}

impl CctorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        CctorRegistry { cells: RwLock::new(FxHashMap::default()) }
    }

    /// The cell for `(assembly, type, type-arg-hash)`, if registered.
    pub fn get(&self, assembly: u32, type_token: Token, type_arg_hash: u32) -> Option<&'static CctorCell> {
        self.cells
            .read()
            .get(&(assembly, type_token.raw(), type_arg_hash))
            .copied()
    }

    fn register(&self, assembly: u32, type_token: Token, type_arg_hash: u32) -> &'static CctorCell {
        let mut cells = self.cells.write();
        cells
            .entry((assembly, type_token.raw(), type_arg_hash))
            .or_insert_with(|| Box::leak(Box::new(CctorCell::new())))
    }

    /// Number of registered cells.
    pub fn len(&self) -> usize {
        self.cells.read().len()
    }

    /// Whether no cells are registered.
    pub fn is_empty(&self) -> bool {
        self.cells.read().is_empty()
    }
}

impl Default for CctorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Ensure the cctor context of `(assembly, type)` under the current
    /// type-argument context is registered, compiling the cctor on first
    /// touch.
    ///
    /// Returns the cell, or `None` when the type has no `.cctor`.
    pub fn ensure_cctor_registered(
        &self,
        assembly: u32,
        type_token: Token,
    ) -> Option<&'static CctorCell> {
        let type_arg_hash = context::current().type_args.hash();
        if let Some(cell) = self.cctors.get(assembly, type_token, type_arg_hash) {
            return Some(cell);
        }

        let cctor_token = self.find_cctor(assembly, type_token)?;

        // Register first: the cctor's own body may resolve this type's
        // statics, and that recursive path must find the cell.
        let cell = self.cctors.register(assembly, type_token, type_arg_hash);
        match self.compile_method_now(assembly, cctor_token) {
            Ok(record) if record.native_code() != 0 => {
                cell.arm(record.native_code());
                debug!(target: "muon::resolve", ?type_token, assembly, "cctor armed");
            }
            _ => {
                debug!(target: "muon::resolve", ?type_token, assembly, "cctor compile failed");
            }
        }
        Some(cell)
    }

    fn find_cctor(&self, assembly: u32, type_token: Token) -> Option<Token> {
        self.provider.methods_of(assembly, type_token).into_iter().find(|&method| {
            self.provider
                .method_row(assembly, method)
                .map(|row| {
                    row.name == ".cctor"
                        && row.flags.contains(MethodAttributes::STATIC)
                        && row.flags.contains(MethodAttributes::RT_SPECIAL_NAME)
                })
                .unwrap_or(false)
        })
    }
}
