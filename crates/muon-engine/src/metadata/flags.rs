//! Metadata attribute words
//!
//! The subset of the CLI attribute flags the resolver inspects.

use bitflags::bitflags;

bitflags! {
    /// TypeDef attribute word.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct TypeAttributes: u32 {
        /// The type is an interface.
        const INTERFACE = 0x0000_0020;
        /// Abstract type.
        const ABSTRACT = 0x0000_0080;
        /// Sealed type.
        const SEALED = 0x0000_0100;
        /// Fields laid out sequentially (the default algorithm applies).
        const SEQUENTIAL_LAYOUT = 0x0000_0008;
        /// Fields carry explicit offsets.
        const EXPLICIT_LAYOUT = 0x0000_0010;
        /// Special-name type.
        const SPECIAL_NAME = 0x0000_0400;
    }
}

bitflags! {
    /// Field attribute word.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct FieldAttributes: u16 {
        /// Static field.
        const STATIC = 0x0010;
        /// Init-only (readonly) field.
        const INIT_ONLY = 0x0020;
        /// Compile-time constant; no storage.
        const LITERAL = 0x0040;
        /// The field has a data RVA (embedded initialized data).
        const HAS_FIELD_RVA = 0x0100;
    }
}

bitflags! {
    /// MethodDef attribute word.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct MethodAttributes: u16 {
        /// Static method.
        const STATIC = 0x0010;
        /// Final (sealed) virtual method.
        const FINAL = 0x0020;
        /// Virtual method.
        const VIRTUAL = 0x0040;
        /// Hide-by-signature.
        const HIDE_BY_SIG = 0x0080;
        /// Introduces a new vtable slot rather than overriding.
        const NEW_SLOT = 0x0100;
        /// Abstract method (no body).
        const ABSTRACT = 0x0400;
        /// Special-name method (`.ctor`, operators).
        const SPECIAL_NAME = 0x0800;
        /// Runtime special name (`.cctor`).
        const RT_SPECIAL_NAME = 0x1000;
    }
}

bitflags! {
    /// MethodDef implementation attribute word.
    #[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
    pub struct MethodImplAttributes: u16 {
        /// Code-type mask; value 3 marks runtime-provided bodies.
        const CODE_TYPE_MASK = 0x0003;
        /// Internal call into the runtime.
        const INTERNAL_CALL = 0x1000;
    }
}

impl MethodImplAttributes {
    /// Runtime-managed body: the marker distinguishing delegate
    /// `.ctor`/`Invoke` specials from normal methods.
    pub fn is_runtime(&self) -> bool {
        self.bits() & Self::CODE_TYPE_MASK.bits() == 0x0003
    }
}
