//! Publication registry
//!
//! Assigns each compiled method a slot holding its encoded unwind record,
//! writes the EH-info block into a data arena disjoint from the code heap,
//! and hands the `(begin, end, unwind)` RVA triple to the platform
//! unwinder. Registration runs under a single lock; published slots are
//! never moved or overwritten.

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error};

use crate::codes::{UnwindError, UnwindFlags};
use crate::ehinfo::{encode_clauses, EhError};
use crate::method_info::JitMethodInfo;

/// Maximum number of published methods.
pub const MAX_METHODS: usize = 256;

/// Size of the EH-info arena in bytes.
pub const EH_ARENA_SIZE: usize = 16 * 1024;

/// Size of one method's persistent unwind-record slot.
const UNWIND_SLOT_SIZE: usize = 64;

/// The platform's function-table registration primitive.
pub trait PlatformUnwinder: Send + Sync {
    /// Register one function's `(begin, end, unwind-record)` RVA triple.
    ///
    /// Returns false if the platform rejected the entry.
    fn add_function_table(&self, begin_rva: u32, end_rva: u32, unwind_rva: u32) -> bool;
}

/// Errors from publishing a method.
///
/// All of these fail the current registration only; previously published
/// entries are unaffected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    /// All method slots in use.
    #[error("method publication registry full ({0} methods)")]
    CapacityExceeded(usize),
    /// EH-info arena exhausted.
    #[error("EH-info arena full")]
    EhArenaFull,
    /// The unwind record did not encode.
    #[error("unwind encoding failed: {0}")]
    Unwind(#[from] UnwindError),
    /// The platform unwinder rejected the entry.
    #[error("platform unwinder rejected function table entry")]
    UnwinderRejected,
}

struct MethodSlot {
    begin_rva: u32,
    end_rva: u32,
    unwind: [u8; UNWIND_SLOT_SIZE],
    unwind_len: usize,
}

impl MethodSlot {
    const fn empty() -> Self {
        MethodSlot {
            begin_rva: 0,
            end_rva: 0,
            unwind: [0; UNWIND_SLOT_SIZE],
            unwind_len: 0,
        }
    }
}

struct RegistryInner {
    slots: Vec<MethodSlot>,
    eh_arena: Box<[u8; EH_ARENA_SIZE]>,
    eh_used: usize,
}

/// Registry of published methods and their unwind/EH metadata.
pub struct JitMethodRegistry {
    inner: Mutex<RegistryInner>,
    /// RVA of the managed personality routine patched into every record
    /// that carries EH flags.
    handler_rva: u32,
}

impl JitMethodRegistry {
    /// Create a registry whose EH-flagged records name `handler_rva` as
    /// their personality routine.
    pub fn new(handler_rva: u32) -> Self {
        let mut slots = Vec::with_capacity(MAX_METHODS);
        slots.resize_with(MAX_METHODS, MethodSlot::empty);
        JitMethodRegistry {
            inner: Mutex::new(RegistryInner {
                slots,
                eh_arena: Box::new([0; EH_ARENA_SIZE]),
                eh_used: 0,
            }),
            handler_rva,
        }
    }

    /// Publish one compiled method.
    ///
    /// Encodes the unwind record into a persistent slot, writes the EH-info
    /// block (4-byte aligned) into the arena, patches the record's handler
    /// and EH-info RVAs, and registers the function-table triple with the
    /// platform unwinder. On any failure the registry is left exactly as it
    /// was.
    pub fn register(
        &self,
        info: &JitMethodInfo,
        unwinder: &dyn PlatformUnwinder,
    ) -> Result<u16, PublishError> {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;

        let index = inner.slots.iter().position(|s| s.unwind_len == 0);
        let index = match index {
            Some(i) => i,
            None => {
                error!(begin_rva = info.begin_rva, "publication registry full");
                return Err(PublishError::CapacityExceeded(MAX_METHODS));
            }
        };

        let has_eh = info.has_eh();
        let flags = if has_eh {
            UnwindFlags::EHANDLER | UnwindFlags::UHANDLER
        } else {
            UnwindFlags::empty()
        };

        let slot = &mut inner.slots[index];
        slot.begin_rva = info.begin_rva;
        slot.end_rva = info.end_rva;
        let encoded = info.unwind.encode(flags, has_eh, &mut slot.unwind)?;
        slot.unwind_len = encoded.len;

        let eh_mark = inner.eh_used;
        if has_eh {
            // The arena is data-only; records in the code heap point into
            // it via the RVA patched below.
            let aligned = (inner.eh_used + 3) & !3;
            let arena = inner.eh_arena.get_mut(aligned..).unwrap_or(&mut []);
            let eh_len = match encode_clauses(&info.clauses(), arena) {
                Ok(len) => len,
                Err(EhError::BufferExhausted) => {
                    slot.unwind_len = 0;
                    return Err(PublishError::EhArenaFull);
                }
                Err(EhError::Malformed) => unreachable!("encoder never reports Malformed"),
            };
            let eh_info_ptr = inner.eh_arena[aligned..].as_ptr() as usize;
            let eh_info_rva = eh_info_ptr.wrapping_sub(info.code_base) as u32;
            inner.eh_used = aligned + eh_len;

            let handler_off = encoded
                .handler_rva_offset
                .expect("EH flags imply a handler RVA field");
            slot.unwind[handler_off..handler_off + 4]
                .copy_from_slice(&self.handler_rva.to_le_bytes());
            let eh_off = encoded
                .eh_info_rva_offset
                .expect("has_eh implies an EH-info RVA field");
            slot.unwind[eh_off..eh_off + 4].copy_from_slice(&eh_info_rva.to_le_bytes());
        }

        let unwind_rva = (slot.unwind.as_ptr() as usize).wrapping_sub(info.code_base) as u32;
        if !unwinder.add_function_table(info.begin_rva, info.end_rva, unwind_rva) {
            slot.unwind_len = 0;
            inner.eh_used = eh_mark;
            return Err(PublishError::UnwinderRejected);
        }

        debug!(
            index,
            begin_rva = info.begin_rva,
            end_rva = info.end_rva,
            has_eh,
            "published method unwind info"
        );
        Ok(index as u16)
    }

    /// Number of published methods.
    pub fn method_count(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.unwind_len > 0).count()
    }

    /// Bytes consumed in the EH-info arena.
    pub fn eh_arena_used(&self) -> usize {
        self.inner.lock().eh_used
    }

    /// Run `f` over the published slot at `index`, if any.
    ///
    /// The callback receives `(begin_rva, end_rva, unwind_record_bytes)`.
    pub fn with_slot<R>(&self, index: u16, f: impl FnOnce(u32, u32, &[u8]) -> R) -> Option<R> {
        let inner = self.inner.lock();
        let slot = inner.slots.get(index as usize)?;
        if slot.unwind_len == 0 {
            return None;
        }
        Some(f(slot.begin_rva, slot.end_rva, &slot.unwind[..slot.unwind_len]))
    }
}
