//! Intrinsic recognition
//!
//! A closed table of methods the emitter expands inline instead of
//! calling: allocation, unchecked reference reinterpretation and
//! arithmetic, span construction, array initialization, and the
//! multi-dimensional array accessors. Matching is by type and member
//! name, never by token, so it works across assembly boundaries.

/// Methods handled inline by the emitter.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Intrinsic {
    /// `Activator.CreateInstance<T>()`: allocate and default-construct,
    /// branching on `T`'s value-type bit.
    ActivatorCreate,
    /// `Unsafe.As<TFrom, TTo>(ref TFrom)`: identity on a managed
    /// reference.
    UnsafeAs,
    /// `Unsafe.Add<T>(ref T, int)`: pointer add by `n * sizeof(T)`; the
    /// size comes from the method-type-arg context.
    UnsafeAdd,
    /// `MemoryMarshal.CreateSpan<T>(ref T, int)`: a 16-byte
    /// `{pointer, length}` struct.
    CreateSpan,
    /// `RuntimeHelpers.InitializeArray(Array, RuntimeFieldHandle)`:
    /// bulk copy from field-RVA data.
    InitArray,
    /// Multi-dimensional array constructor.
    MdArrayCtor,
    /// Multi-dimensional array element load.
    MdArrayGet,
    /// Multi-dimensional array element store.
    MdArraySet,
    /// Multi-dimensional array element address.
    MdArrayAddress,
}

/// Recognize an intrinsic by declaring-type and member name.
pub fn detect(type_name: &str, method_name: &str) -> Option<Intrinsic> {
    match (type_name, method_name) {
        ("System.Activator", "CreateInstance") => Some(Intrinsic::ActivatorCreate),
        ("System.Runtime.CompilerServices.Unsafe", "As") => Some(Intrinsic::UnsafeAs),
        ("System.Runtime.CompilerServices.Unsafe", "Add") => Some(Intrinsic::UnsafeAdd),
        ("System.Runtime.InteropServices.MemoryMarshal", "CreateSpan") => {
            Some(Intrinsic::CreateSpan)
        }
        ("System.Runtime.CompilerServices.RuntimeHelpers", "InitializeArray") => {
            Some(Intrinsic::InitArray)
        }
        _ => None,
    }
}

/// Recognize a multi-dimensional array accessor by member name (the
/// caller has already established the declaring type is an `ARRAY`
/// TypeSpec).
pub fn detect_md_array(method_name: &str) -> Option<Intrinsic> {
    match method_name {
        ".ctor" => Some(Intrinsic::MdArrayCtor),
        "Get" => Some(Intrinsic::MdArrayGet),
        "Set" => Some(Intrinsic::MdArraySet),
        "Address" => Some(Intrinsic::MdArrayAddress),
        _ => None,
    }
}
