//! Exception-handler clause encoding
//!
//! EH-info blocks live in a data arena separate from the code heap. Layout:
//! clause count as a variable-length unsigned, then per clause
//! `try_start`, `(try_length << 2) | kind`, `handler_offset`, followed by
//! kind-specific data (a raw 4-byte type RVA for typed clauses, a
//! variable-length filter offset for filter clauses).

use thiserror::Error;

use crate::encoding::{read_uint, write_uint};

/// IL-side clause flag values.
const IL_CLAUSE_EXCEPTION: u32 = 0;
const IL_CLAUSE_FILTER: u32 = 1;
const IL_CLAUSE_FINALLY: u32 = 2;
const IL_CLAUSE_FAULT: u32 = 4;

/// Clause kind, as stored in the low two bits of the second field.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EhClauseKind {
    /// Catch of a specific exception type.
    Typed = 0,
    /// Filter clause (`when` expression).
    Filter = 1,
    /// Finally handler.
    Finally = 2,
    /// Fault handler (finally that only runs on exception).
    Fault = 3,
}

impl EhClauseKind {
    /// Map the IL clause flag mask to a kind.
    pub fn from_il_flags(flags: u32) -> Option<EhClauseKind> {
        match flags {
            IL_CLAUSE_EXCEPTION => Some(EhClauseKind::Typed),
            IL_CLAUSE_FILTER => Some(EhClauseKind::Filter),
            IL_CLAUSE_FINALLY => Some(EhClauseKind::Finally),
            IL_CLAUSE_FAULT => Some(EhClauseKind::Fault),
            _ => None,
        }
    }

    fn from_bits(bits: u32) -> EhClauseKind {
        match bits & 0b11 {
            0 => EhClauseKind::Typed,
            1 => EhClauseKind::Filter,
            2 => EhClauseKind::Finally,
            _ => EhClauseKind::Fault,
        }
    }
}

/// Kind-specific clause payload.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EhClauseBody {
    /// Catch clause with the RVA of the caught type's handle.
    Typed {
        /// RVA of the exception type's method table.
        type_rva: u32,
    },
    /// Filter clause with the code offset of the filter expression.
    Filter {
        /// Method-relative offset of the filter funclet.
        filter_offset: u32,
    },
    /// Finally handler, no payload.
    Finally,
    /// Fault handler, no payload.
    Fault,
}

impl EhClauseBody {
    /// The kind discriminant this body encodes as.
    pub fn kind(&self) -> EhClauseKind {
        match self {
            EhClauseBody::Typed { .. } => EhClauseKind::Typed,
            EhClauseBody::Filter { .. } => EhClauseKind::Filter,
            EhClauseBody::Finally => EhClauseKind::Finally,
            EhClauseBody::Fault => EhClauseKind::Fault,
        }
    }
}

/// One protected region and its handler.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EhClause {
    /// Method-relative offset where the try region starts.
    pub try_start: u32,
    /// Length of the try region in bytes.
    pub try_length: u32,
    /// Method-relative offset of the handler.
    pub handler_offset: u32,
    /// Kind and kind-specific data.
    pub body: EhClauseBody,
}

/// Errors from encoding or walking an EH-info block.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EhError {
    /// Output arena slice exhausted mid-encode.
    #[error("EH-info buffer exhausted")]
    BufferExhausted,
    /// Block bytes did not decode as written.
    #[error("malformed EH-info block")]
    Malformed,
}

/// Encode `clauses` into `out`, returning the number of bytes written.
pub fn encode_clauses(clauses: &[EhClause], out: &mut [u8]) -> Result<usize, EhError> {
    let mut pos = 0;
    let mut put = |value: u32, out: &mut [u8], pos: &mut usize| -> Result<(), EhError> {
        let written = write_uint(value, &mut out[*pos..]).ok_or(EhError::BufferExhausted)?;
        *pos += written;
        Ok(())
    };

    put(clauses.len() as u32, out, &mut pos)?;
    for clause in clauses {
        put(clause.try_start, out, &mut pos)?;
        put((clause.try_length << 2) | clause.body.kind() as u32, out, &mut pos)?;
        put(clause.handler_offset, out, &mut pos)?;
        match clause.body {
            EhClauseBody::Typed { type_rva } => {
                let end = pos + 4;
                if out.len() < end {
                    return Err(EhError::BufferExhausted);
                }
                out[pos..end].copy_from_slice(&type_rva.to_le_bytes());
                pos = end;
            }
            EhClauseBody::Filter { filter_offset } => {
                put(filter_offset, out, &mut pos)?;
            }
            EhClauseBody::Finally | EhClauseBody::Fault => {}
        }
    }
    Ok(pos)
}

/// Decode an EH-info block written by [`encode_clauses`].
pub fn decode_clauses(buf: &[u8]) -> Result<Vec<EhClause>, EhError> {
    let mut pos = 0;
    let mut take = |pos: &mut usize| -> Result<u32, EhError> {
        let (value, consumed) = read_uint(&buf[*pos..]).ok_or(EhError::Malformed)?;
        *pos += consumed;
        Ok(value)
    };

    let count = take(&mut pos)?;
    let mut clauses = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let try_start = take(&mut pos)?;
        let packed = take(&mut pos)?;
        let handler_offset = take(&mut pos)?;
        let kind = EhClauseKind::from_bits(packed);
        let body = match kind {
            EhClauseKind::Typed => {
                let end = pos + 4;
                let bytes = buf.get(pos..end).ok_or(EhError::Malformed)?;
                pos = end;
                EhClauseBody::Typed {
                    type_rva: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                }
            }
            EhClauseKind::Filter => EhClauseBody::Filter { filter_offset: take(&mut pos)? },
            EhClauseKind::Finally => EhClauseBody::Finally,
            EhClauseKind::Fault => EhClauseBody::Fault,
        };
        clauses.push(EhClause {
            try_start,
            try_length: packed >> 2,
            handler_offset,
            body,
        });
    }
    Ok(clauses)
}
