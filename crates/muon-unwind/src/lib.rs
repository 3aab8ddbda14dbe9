//! JIT method unwind and exception-handling publication
//!
//! Every method the JIT produces must be walkable by the platform unwinder
//! before control returns to managed code. This crate builds the per-method
//! unwind record (prolog codes, frame register, flags), encodes the
//! exception-handler clause table into a data arena, and registers the
//! `(begin, end, unwind)` RVA triple with the platform's function-table
//! primitive.
//!
//! The platform registration call itself is a collaborator behind the
//! [`PlatformUnwinder`] trait; everything else is owned here.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod codes;
pub mod encoding;
pub mod ehinfo;
pub mod method_info;
pub mod registry;

pub use codes::{
    decode_unwind, DecodedUnwind, EncodedUnwind, PrologOp, Reg, UnwindError, UnwindFlags,
    UnwindInfo, UnwindOp, MAX_UNWIND_CODES,
};
pub use ehinfo::{decode_clauses, encode_clauses, EhClause, EhClauseBody, EhClauseKind, EhError};
pub use method_info::{JitMethodInfo, MAX_EH_CLAUSES};
pub use registry::{JitMethodRegistry, PlatformUnwinder, PublishError, EH_ARENA_SIZE, MAX_METHODS};
