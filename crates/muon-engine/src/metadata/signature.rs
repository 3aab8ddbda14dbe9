//! Signature blob decoding
//!
//! A cursor over type and method signature blobs: compressed integers,
//! element-type dispatch, coded TypeDef/TypeRef/TypeSpec tokens, and
//! whole-type skipping. Decoding never reads out of bounds; malformed
//! blobs surface as errors the resolver treats as a resolution miss.

use thiserror::Error;

use crate::metadata::token::{TableId, Token};

/// CLI element-type constants.
#[allow(missing_docs)]
pub mod element_type {
    pub const END: u8 = 0x00;
    pub const VOID: u8 = 0x01;
    pub const BOOLEAN: u8 = 0x02;
    pub const CHAR: u8 = 0x03;
    pub const I1: u8 = 0x04;
    pub const U1: u8 = 0x05;
    pub const I2: u8 = 0x06;
    pub const U2: u8 = 0x07;
    pub const I4: u8 = 0x08;
    pub const U4: u8 = 0x09;
    pub const I8: u8 = 0x0A;
    pub const U8: u8 = 0x0B;
    pub const R4: u8 = 0x0C;
    pub const R8: u8 = 0x0D;
    pub const STRING: u8 = 0x0E;
    pub const PTR: u8 = 0x0F;
    pub const BYREF: u8 = 0x10;
    pub const VALUETYPE: u8 = 0x11;
    pub const CLASS: u8 = 0x12;
    pub const VAR: u8 = 0x13;
    pub const ARRAY: u8 = 0x14;
    pub const GENERICINST: u8 = 0x15;
    pub const TYPEDBYREF: u8 = 0x16;
    pub const I: u8 = 0x18;
    pub const U: u8 = 0x19;
    pub const FNPTR: u8 = 0x1B;
    pub const OBJECT: u8 = 0x1C;
    pub const SZARRAY: u8 = 0x1D;
    pub const MVAR: u8 = 0x1E;
    pub const CMOD_REQD: u8 = 0x1F;
    pub const CMOD_OPT: u8 = 0x20;
    pub const SENTINEL: u8 = 0x41;
    pub const PINNED: u8 = 0x45;
}

/// Calling-convention byte values and masks.
#[allow(missing_docs)]
pub mod calling_convention {
    pub const DEFAULT: u8 = 0x00;
    pub const VARARG: u8 = 0x05;
    pub const FIELD: u8 = 0x06;
    pub const LOCAL_SIG: u8 = 0x07;
    pub const PROPERTY: u8 = 0x08;
    pub const GENERIC_INST: u8 = 0x0A;
    pub const MASK: u8 = 0x0F;
    pub const GENERIC: u8 = 0x10;
    pub const HAS_THIS: u8 = 0x20;
    pub const EXPLICIT_THIS: u8 = 0x40;
}

/// Decoding errors; all are treated as resolution misses by callers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SigError {
    /// Cursor ran off the end of the blob.
    #[error("signature ended unexpectedly at offset {0}")]
    UnexpectedEnd(usize),
    /// Element byte outside the known encoding.
    #[error("unknown element type 0x{0:02X} at offset {1}")]
    UnknownElementType(u8, usize),
    /// Nesting deeper than any well-formed signature produces.
    #[error("signature nesting too deep")]
    TooDeep,
}

/// Nesting bound for recursive type producers.
const MAX_DEPTH: u32 = 64;

/// A read cursor over one signature blob.
#[derive(Debug, Clone)]
pub struct SigReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SigReader<'a> {
    /// Read from the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        SigReader { data, pos: 0 }
    }

    /// Current cursor offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes remaining past the cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Next byte without advancing.
    pub fn peek(&self) -> Result<u8, SigError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(SigError::UnexpectedEnd(self.pos))
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8, SigError> {
        let byte = self.peek()?;
        self.pos += 1;
        Ok(byte)
    }

    /// Read a compressed unsigned integer (ECMA II.23.2): one byte for
    /// values under 0x80, two bytes with a `10` prefix, four bytes with a
    /// `110` prefix.
    pub fn read_compressed_u32(&mut self) -> Result<u32, SigError> {
        let first = self.read_u8()?;
        if first & 0x80 == 0 {
            Ok(first as u32)
        } else if first & 0xC0 == 0x80 {
            let second = self.read_u8()?;
            Ok((((first & 0x3F) as u32) << 8) | second as u32)
        } else if first & 0xE0 == 0xC0 {
            let b1 = self.read_u8()? as u32;
            let b2 = self.read_u8()? as u32;
            let b3 = self.read_u8()? as u32;
            Ok((((first & 0x1F) as u32) << 24) | (b1 << 16) | (b2 << 8) | b3)
        } else {
            Err(SigError::UnknownElementType(first, self.pos - 1))
        }
    }

    /// Read a coded TypeDefOrRef token: low two bits select the table,
    /// the rest is the row id.
    pub fn read_type_def_or_ref(&mut self) -> Result<Token, SigError> {
        let coded = self.read_compressed_u32()?;
        let table = match coded & 0x3 {
            0 => TableId::TypeDef,
            1 => TableId::TypeRef,
            2 => TableId::TypeSpec,
            _ => return Err(SigError::UnknownElementType(coded as u8, self.pos)),
        };
        Ok(Token::from_parts(table, coded >> 2))
    }

    /// Advance past exactly one type producer.
    pub fn skip_type(&mut self) -> Result<(), SigError> {
        self.skip_type_at_depth(0)
    }

    fn skip_type_at_depth(&mut self, depth: u32) -> Result<(), SigError> {
        use element_type::*;

        if depth > MAX_DEPTH {
            return Err(SigError::TooDeep);
        }
        let element = self.read_u8()?;
        match element {
            VOID | BOOLEAN | CHAR | I1 | U1 | I2 | U2 | I4 | U4 | I8 | U8 | R4 | R8 | STRING
            | TYPEDBYREF | I | U | OBJECT => Ok(()),
            VAR | MVAR => {
                self.read_compressed_u32()?;
                Ok(())
            }
            PTR | BYREF | SZARRAY | PINNED | SENTINEL => self.skip_type_at_depth(depth + 1),
            CLASS | VALUETYPE => {
                self.read_type_def_or_ref()?;
                Ok(())
            }
            CMOD_OPT | CMOD_REQD => {
                self.read_type_def_or_ref()?;
                self.skip_type_at_depth(depth + 1)
            }
            GENERICINST => {
                // kind byte (CLASS or VALUETYPE), base type, arg count, args
                self.read_u8()?;
                self.read_type_def_or_ref()?;
                let arg_count = self.read_compressed_u32()?;
                for _ in 0..arg_count {
                    self.skip_type_at_depth(depth + 1)?;
                }
                Ok(())
            }
            ARRAY => {
                self.skip_type_at_depth(depth + 1)?;
                let _rank = self.read_compressed_u32()?;
                let num_sizes = self.read_compressed_u32()?;
                for _ in 0..num_sizes {
                    self.read_compressed_u32()?;
                }
                let num_lo_bounds = self.read_compressed_u32()?;
                for _ in 0..num_lo_bounds {
                    self.read_compressed_u32()?;
                }
                Ok(())
            }
            FNPTR => self.skip_method_sig(depth + 1),
            other => Err(SigError::UnknownElementType(other, self.pos - 1)),
        }
    }

    /// Advance past a full method signature (calling convention, generic
    /// arity, parameter count, return type, parameters).
    pub fn skip_method_sig(&mut self, depth: u32) -> Result<(), SigError> {
        use calling_convention::*;

        if depth > MAX_DEPTH {
            return Err(SigError::TooDeep);
        }
        let conv = self.read_u8()?;
        if conv & GENERIC != 0 {
            self.read_compressed_u32()?;
        }
        let param_count = self.read_compressed_u32()?;
        self.skip_type_at_depth(depth)?; // return type
        for _ in 0..param_count {
            if self.peek()? == element_type::SENTINEL {
                self.read_u8()?;
            }
            self.skip_type_at_depth(depth)?;
        }
        Ok(())
    }
}

/// Decoded header of a method signature: convention, `this`, arity.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MethodSigHeader {
    /// Raw calling-convention byte.
    pub convention: u8,
    /// The method takes a `this` argument.
    pub has_this: bool,
    /// The method is generic, with this many type parameters.
    pub generic_arity: u32,
    /// Declared parameter count (excluding `this`).
    pub param_count: u32,
    /// Vararg calling convention.
    pub is_vararg: bool,
}

/// Read a method signature header, leaving the cursor at the return type.
pub fn read_method_sig_header(reader: &mut SigReader<'_>) -> Result<MethodSigHeader, SigError> {
    use calling_convention::*;

    let convention = reader.read_u8()?;
    let generic_arity = if convention & GENERIC != 0 {
        reader.read_compressed_u32()?
    } else {
        0
    };
    let param_count = reader.read_compressed_u32()?;
    Ok(MethodSigHeader {
        convention,
        has_this: convention & HAS_THIS != 0,
        generic_arity,
        param_count,
        is_vararg: convention & MASK == VARARG,
    })
}
