//! x86-64 unwind records
//!
//! Builds and encodes the per-method UNWIND_INFO block consumed by the
//! platform unwinder: a four-byte header, the prolog unwind codes in
//! reverse-chronological order, and (for methods with EH clauses) the
//! handler RVA plus the native-AOT extension byte pointing at the EH-info
//! block.

use bitflags::bitflags;
use thiserror::Error;

/// Non-volatile register numbering used in unwind-code op-info nibbles.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn from_nibble(value: u8) -> Reg {
        match value & 0xF {
            0 => Reg::Rax,
            1 => Reg::Rcx,
            2 => Reg::Rdx,
            3 => Reg::Rbx,
            4 => Reg::Rsp,
            5 => Reg::Rbp,
            6 => Reg::Rsi,
            7 => Reg::Rdi,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            _ => Reg::R15,
        }
    }
}

const UWOP_PUSH_NONVOL: u8 = 0;
const UWOP_ALLOC_LARGE: u8 = 1;
const UWOP_ALLOC_SMALL: u8 = 2;
const UWOP_SET_FPREG: u8 = 3;

/// Unwind record format version.
const UNWIND_VERSION: u8 = 1;

bitflags! {
    /// Header flag bits (shifted above the 3-bit version field).
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct UnwindFlags: u8 {
        /// The method has an exception handler.
        const EHANDLER = 0x1;
        /// The method has a termination (unwind) handler.
        const UHANDLER = 0x2;
        /// Chained unwind info (unused here).
        const CHAININFO = 0x4;
    }
}

/// Native-AOT extension: function kind byte appended after the handler RVA.
pub const FUNC_KIND_ROOT: u8 = 0x00;
/// Extension flag: a 4-byte EH-info RVA follows the kind byte.
pub const FUNC_KIND_HAS_EHINFO: u8 = 0x04;

/// One prolog operation, recorded in chronological order.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UnwindOp {
    /// `push <reg>` of a non-volatile register.
    PushNonvolatile(Reg),
    /// `mov rbp, rsp` establishing the frame pointer.
    SetFrameRegister,
    /// `sub rsp, n` for n in 8..=128.
    AllocSmall(u16),
    /// `sub rsp, n` for larger n (up to 512 KiB, 8-byte granular).
    AllocLarge(u32),
}

impl UnwindOp {
    /// Number of 16-bit code slots this op occupies.
    fn slot_count(&self) -> usize {
        match self {
            UnwindOp::AllocLarge(_) => 2,
            _ => 1,
        }
    }
}

/// A prolog op together with the prolog offset *after* its instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PrologOp {
    /// Offset of the end of the instruction from the method start.
    pub offset: u8,
    /// The operation performed.
    pub op: UnwindOp,
}

/// Errors from building or encoding an unwind record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnwindError {
    /// More prolog ops than the fixed code buffer can hold.
    #[error("too many unwind codes (max {0})")]
    TooManyCodes(usize),
    /// Stack allocation size not representable by the supported codes.
    #[error("unsupported stack allocation size {0}")]
    BadAllocSize(u32),
    /// Output buffer too small for the encoded record.
    #[error("unwind buffer too small")]
    BufferTooSmall,
    /// Record bytes did not decode as a version-1 unwind record.
    #[error("malformed unwind record")]
    Malformed,
}

/// Maximum number of 16-bit unwind-code slots per method.
pub const MAX_UNWIND_CODES: usize = 8;

/// Largest stack allocation expressible by the two-slot ALLOC_LARGE form.
const MAX_LARGE_ALLOC: u32 = 512 * 1024 - 8;

/// Builder and in-memory form of one method's unwind description.
///
/// Ops are recorded in prolog (chronological) order; encoding reverses
/// them as the unwinder expects.
#[derive(Debug, Clone)]
pub struct UnwindInfo {
    /// Length of the prolog in bytes.
    pub prolog_size: u8,
    /// Established frame register, if any.
    pub frame_register: Option<Reg>,
    /// Scaled frame-register offset (stored in the header's high nibble).
    pub frame_offset: u8,
    ops: [Option<PrologOp>; MAX_UNWIND_CODES],
    op_count: usize,
}

impl UnwindInfo {
    /// A frameless record with an empty prolog.
    pub fn new() -> Self {
        UnwindInfo {
            prolog_size: 0,
            frame_register: None,
            frame_offset: 0,
            ops: [None; MAX_UNWIND_CODES],
            op_count: 0,
        }
    }

    fn record(&mut self, offset: u8, op: UnwindOp) -> Result<(), UnwindError> {
        if self.op_count == MAX_UNWIND_CODES {
            return Err(UnwindError::TooManyCodes(MAX_UNWIND_CODES));
        }
        self.ops[self.op_count] = Some(PrologOp { offset, op });
        self.op_count += 1;
        if offset > self.prolog_size {
            self.prolog_size = offset;
        }
        Ok(())
    }

    /// Record a non-volatile register push ending at `offset`.
    pub fn push_nonvolatile(&mut self, reg: Reg, offset: u8) -> Result<(), UnwindError> {
        self.record(offset, UnwindOp::PushNonvolatile(reg))
    }

    /// Record the frame-pointer establishment ending at `offset`.
    pub fn set_frame_register(&mut self, reg: Reg, offset: u8) -> Result<(), UnwindError> {
        self.frame_register = Some(reg);
        self.record(offset, UnwindOp::SetFrameRegister)
    }

    /// Record a `sub rsp, size` ending at `offset`, choosing the small or
    /// large code form by size.
    pub fn alloc_stack(&mut self, size: u32, offset: u8) -> Result<(), UnwindError> {
        if size == 0 || size % 8 != 0 || size > MAX_LARGE_ALLOC {
            return Err(UnwindError::BadAllocSize(size));
        }
        let op = if size <= 128 {
            UnwindOp::AllocSmall(size as u16)
        } else {
            UnwindOp::AllocLarge(size)
        };
        self.record(offset, op)
    }

    /// Recorded ops in chronological order.
    pub fn ops(&self) -> impl Iterator<Item = &PrologOp> {
        self.ops[..self.op_count].iter().flatten()
    }

    /// Total 16-bit slots the codes occupy, before padding.
    pub fn code_slot_count(&self) -> usize {
        self.ops().map(|p| p.op.slot_count()).sum()
    }

    /// Encode the record into `out`.
    ///
    /// With `flags` non-empty, the record is followed by a zeroed 4-byte
    /// handler-RVA field and the native-AOT extension (kind byte plus, when
    /// `has_eh_info`, a zeroed 4-byte EH-info RVA); both RVA fields are
    /// patched later by the registrar via the offsets in [`EncodedUnwind`].
    pub fn encode(
        &self,
        flags: UnwindFlags,
        has_eh_info: bool,
        out: &mut [u8],
    ) -> Result<EncodedUnwind, UnwindError> {
        let slots = self.code_slot_count();
        if slots > MAX_UNWIND_CODES {
            return Err(UnwindError::TooManyCodes(MAX_UNWIND_CODES));
        }
        let padded_slots = slots + (slots & 1);
        let mut len = 4 + padded_slots * 2;
        let mut handler_rva_offset = None;
        let mut eh_info_rva_offset = None;
        if !flags.is_empty() {
            handler_rva_offset = Some(len);
            len += 4;
            len += 1; // extension kind byte
            if has_eh_info {
                eh_info_rva_offset = Some(len);
                len += 4;
            }
        }
        if out.len() < len {
            return Err(UnwindError::BufferTooSmall);
        }

        out[0] = UNWIND_VERSION | (flags.bits() << 3);
        out[1] = self.prolog_size;
        out[2] = slots as u8;
        out[3] = self.frame_register.map_or(0, |r| r as u8) | (self.frame_offset << 4);

        // Codes run newest-first: the unwinder replays the prolog backwards.
        let mut cursor = 4;
        for prolog_op in self.ops[..self.op_count].iter().rev().flatten() {
            let (op, info) = match prolog_op.op {
                UnwindOp::PushNonvolatile(reg) => (UWOP_PUSH_NONVOL, reg as u8),
                UnwindOp::SetFrameRegister => (UWOP_SET_FPREG, 0),
                UnwindOp::AllocSmall(size) => {
                    (UWOP_ALLOC_SMALL, ((size - 8) / 8) as u8)
                }
                UnwindOp::AllocLarge(_) => (UWOP_ALLOC_LARGE, 0),
            };
            let code = u16::from_le_bytes([prolog_op.offset, op | (info << 4)]);
            out[cursor..cursor + 2].copy_from_slice(&code.to_le_bytes());
            cursor += 2;
            if let UnwindOp::AllocLarge(size) = prolog_op.op {
                let scaled = (size / 8) as u16;
                out[cursor..cursor + 2].copy_from_slice(&scaled.to_le_bytes());
                cursor += 2;
            }
        }
        // Zero-pad to the 2-slot boundary.
        if slots & 1 == 1 {
            out[cursor] = 0;
            out[cursor + 1] = 0;
            cursor += 2;
        }

        if let Some(off) = handler_rva_offset {
            out[off..off + 4].fill(0);
            cursor = off + 4;
            let kind = if has_eh_info {
                FUNC_KIND_ROOT | FUNC_KIND_HAS_EHINFO
            } else {
                FUNC_KIND_ROOT
            };
            out[cursor] = kind;
            cursor += 1;
            if let Some(eh_off) = eh_info_rva_offset {
                out[eh_off..eh_off + 4].fill(0);
                cursor = eh_off + 4;
            }
        }
        debug_assert_eq!(cursor, len);

        Ok(EncodedUnwind {
            len,
            handler_rva_offset,
            eh_info_rva_offset,
        })
    }
}

impl Default for UnwindInfo {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of encoding: total length plus patch points for the registrar.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EncodedUnwind {
    /// Total encoded length in bytes.
    pub len: usize,
    /// Offset of the 4-byte handler RVA, when flags were set.
    pub handler_rva_offset: Option<usize>,
    /// Offset of the 4-byte EH-info RVA in the extension, when present.
    pub eh_info_rva_offset: Option<usize>,
}

/// Decoded view of an unwind record, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedUnwind {
    /// Header flag bits.
    pub flags: UnwindFlags,
    /// Prolog length in bytes.
    pub prolog_size: u8,
    /// Frame register, if the header names one.
    pub frame_register: Option<Reg>,
    /// Scaled frame offset from the header's high nibble.
    pub frame_offset: u8,
    /// Raw slot count from the header.
    pub code_count: u8,
    /// Decoded ops, newest-first as stored.
    pub ops: Vec<PrologOp>,
}

/// Decode a version-1 unwind record produced by [`UnwindInfo::encode`].
pub fn decode_unwind(buf: &[u8]) -> Result<DecodedUnwind, UnwindError> {
    if buf.len() < 4 || buf[0] & 0x7 != UNWIND_VERSION {
        return Err(UnwindError::Malformed);
    }
    let flags = UnwindFlags::from_bits_truncate(buf[0] >> 3);
    let prolog_size = buf[1];
    let code_count = buf[2];
    let frame_register = match buf[3] & 0xF {
        0 => None,
        n => Some(Reg::from_nibble(n)),
    };
    let frame_offset = buf[3] >> 4;

    let mut ops = Vec::new();
    let mut slot = 0usize;
    while slot < code_count as usize {
        let base = 4 + slot * 2;
        let code = buf.get(base..base + 2).ok_or(UnwindError::Malformed)?;
        let offset = code[0];
        let op = code[1] & 0xF;
        let info = code[1] >> 4;
        let decoded = match op {
            UWOP_PUSH_NONVOL => UnwindOp::PushNonvolatile(Reg::from_nibble(info)),
            UWOP_SET_FPREG => UnwindOp::SetFrameRegister,
            UWOP_ALLOC_SMALL => UnwindOp::AllocSmall((info as u16) * 8 + 8),
            UWOP_ALLOC_LARGE => {
                slot += 1;
                let base = 4 + slot * 2;
                let extra = buf.get(base..base + 2).ok_or(UnwindError::Malformed)?;
                let scaled = u16::from_le_bytes([extra[0], extra[1]]);
                UnwindOp::AllocLarge(scaled as u32 * 8)
            }
            _ => return Err(UnwindError::Malformed),
        };
        ops.push(PrologOp { offset, op: decoded });
        slot += 1;
    }

    Ok(DecodedUnwind {
        flags,
        prolog_size,
        frame_register,
        frame_offset,
        code_count,
        ops,
    })
}
