//! Layout constants and entrypoints the generated code relies on.
//!
//! These values describe the runtime the code runs against: the thread
//! block addressed through the thread register, managed object headers, the
//! method record and the card table.

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const POINTER_SIZE: u32 = 4;
pub const HEAP_REFERENCE_SIZE: u32 = 4;

/// Bytes below the stack pointer that must be addressable; the probe at
/// frame entry touches `sp - STACK_OVERFLOW_RESERVED_BYTES`.
pub const STACK_OVERFLOW_RESERVED_BYTES: u32 = 8 * 1024;

/// Largest frame the backend will produce.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

pub mod thread {
    /// Flags polled by suspend checks; non-zero requests a suspension.
    pub const FLAGS_OFFSET: i32 = 0;
    pub const IS_GC_MARKING_OFFSET: i32 = 8;
    pub const CARD_TABLE_OFFSET: i32 = 12;
    pub const EXCEPTION_OFFSET: i32 = 16;
    pub const STACK_END_OFFSET: i32 = 20;
    pub const SELF_OFFSET: i32 = 24;
    pub const METHOD_TRACE_BUFFER_OFFSET: i32 = 28;
    /// Pointer to a word the runtime unmaps to request a suspension from
    /// code using implicit suspend checks.
    pub const SUSPEND_TRIGGER_OFFSET: i32 = 32;
    pub const TID_OFFSET: i32 = 36;
    /// Start of the quick entrypoint table.
    pub const QUICK_ENTRYPOINTS_OFFSET: i32 = 128;
    /// Per-register mark entrypoints used by read barriers.
    pub const READ_BARRIER_MARK_ENTRYPOINTS_OFFSET: i32 = 640;

    /// Replacement methods for `String` constructors, one slot per index.
    pub const STRING_INIT_ENTRYPOINTS_OFFSET: i32 = 512;

    pub const SUSPEND_OR_CHECKPOINT_REQUEST: u32 = 0b11;

    pub fn string_init_entrypoint_offset(index: u32) -> i32 {
        STRING_INIT_ENTRYPOINTS_OFFSET + (index * super::POINTER_SIZE) as i32
    }
}

pub mod object {
    pub const CLASS_OFFSET: i32 = 0;
    pub const MONITOR_OFFSET: i32 = 4;
    pub const ARRAY_LENGTH_OFFSET: i32 = 8;
    pub const STRING_COUNT_OFFSET: i32 = 8;
    pub const STRING_VALUE_OFFSET: i32 = 16;

    /// Offset of element 0 for elements of `1 << size_shift` bytes.
    pub fn array_data_offset(size_shift: u32) -> i32 {
        if size_shift == 3 { 16 } else { 12 }
    }

    /// Bit of the lock word holding the read barrier state.
    pub const LOCK_WORD_READ_BARRIER_STATE_SHIFT: u32 = 28;
    pub const LOCK_WORD_MARK_BIT_SHIFT: u32 = 29;
}

pub mod class {
    pub const SUPER_CLASS_OFFSET: i32 = 56;
    pub const COMPONENT_TYPE_OFFSET: i32 = 36;
    pub const PRIMITIVE_TYPE_OFFSET: i32 = 88;
    pub const STATUS_OFFSET: i32 = 112;
    pub const IFTABLE_OFFSET: i32 = 44;
    pub const IMT_PTR_OFFSET: i32 = 120;
    pub const EMBEDDED_VTABLE_OFFSET: i32 = 128;
    pub const ACCESS_FLAGS_OFFSET: i32 = 64;
    pub const CLINIT_THREAD_ID_OFFSET: i32 = 100;

    /// Byte of the status word compared against `VISIBLY_INITIALIZED`.
    pub const STATUS_BYTE_OFFSET: i32 = STATUS_OFFSET + 3;
    pub const STATUS_LSB_POSITION: u32 = 4;
    pub const VISIBLY_INITIALIZED: u32 = 15;
    pub const INITIALIZED: u32 = 14;
    pub const INITIALIZING: u32 = 13;

    /// Primitive type stored in a class for `Object` components.
    pub const PRIMITIVE_NOT: u32 = 0;
    pub const PRIMITIVE_TYPE_SIZE_SHIFT_SHIFT: u32 = 16;

    /// Bitstring checks compare the low bits of the status word.
    pub const BITSTRING_STATUS_OFFSET: i32 = STATUS_OFFSET;

    pub fn embedded_vtable_entry_offset(index: u32) -> i32 {
        EMBEDDED_VTABLE_OFFSET + (index * super::POINTER_SIZE) as i32
    }
}

pub mod method {
    pub const DECLARING_CLASS_OFFSET: i32 = 0;
    pub const ACCESS_FLAGS_OFFSET: i32 = 4;
    pub const HOTNESS_COUNT_OFFSET: i32 = 18;
    pub const ENTRY_POINT_FROM_QUICK_OFFSET: i32 = 28;
    pub const DATA_OFFSET: i32 = 24;

    pub const ACC_FAST_INTERPRETER_TO_INTERPRETER_INVOKE: u32 = 0x4000_0000;
}

pub mod iftable {
    /// Each entry is a (interface, method array) pair of references.
    pub const ENTRY_SIZE: i32 = 8;
}

pub mod imt {
    pub const SIZE: u32 = 43;

    pub fn entry_offset(index: u32) -> i32 {
        ((index % SIZE) * super::POINTER_SIZE) as i32
    }
}

pub mod card_table {
    pub const CARD_SHIFT: u32 = 10;
}

pub mod profiling {
    /// Offset of the baseline hotness counter in the JIT profiling record.
    pub const BASELINE_HOTNESS_COUNT_OFFSET: i32 = 8;
    pub const INITIAL_HOTNESS: u16 = 0x3fff;
}

/// Entrypoints reachable through the thread register.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum QuickEntrypoint {
    AllocObjectResolved,
    AllocObjectInitialized,
    AllocObjectWithChecks,
    AllocArrayResolved,
    AllocArrayResolved8,
    AllocArrayResolved16,
    AllocArrayResolved32,
    AllocArrayResolved64,
    InstanceofNonTrivial,
    CheckInstanceOf,
    InitializeStaticStorage,
    ResolveTypeAndVerifyAccess,
    ResolveType,
    ResolveString,
    ResolveMethodHandle,
    ResolveMethodType,
    AputObject,
    DeliverException,
    ThrowNullPointer,
    ThrowDivZero,
    ThrowArrayBounds,
    ThrowStringBounds,
    TestSuspend,
    Deoptimize,
    CompileOptimized,
    MethodEntryHook,
    MethodExitHook,
    Idivmod,
    Ldiv,
    Lmod,
    Fmodf,
    Fmod,
    L2f,
    L2d,
    F2l,
    D2l,
    InvokeDirectTrampolineWithAccessCheck,
    InvokeStaticTrampolineWithAccessCheck,
    InvokeVirtualTrampolineWithAccessCheck,
    InvokeSuperTrampolineWithAccessCheck,
    InvokeInterfaceTrampolineWithAccessCheck,
    InvokePolymorphic,
    InvokeCustom,
    QuickImtConflictTrampoline,
    ReadBarrierSlow,
    ReadBarrierForRootSlow,
    QuickResolutionTrampoline,
}

impl QuickEntrypoint {
    /// Offset of the entrypoint slot from the thread register.
    pub fn offset(self) -> i32 {
        thread::QUICK_ENTRYPOINTS_OFFSET + u8::from(self) as i32 * POINTER_SIZE as i32
    }

    /// Whether the runtime function may suspend and walk the stack.
    pub fn needs_safepoint(self) -> bool {
        !matches!(
            self,
            QuickEntrypoint::Idivmod
                | QuickEntrypoint::Ldiv
                | QuickEntrypoint::Lmod
                | QuickEntrypoint::Fmodf
                | QuickEntrypoint::Fmod
                | QuickEntrypoint::L2f
                | QuickEntrypoint::L2d
                | QuickEntrypoint::F2l
                | QuickEntrypoint::D2l
                | QuickEntrypoint::ReadBarrierSlow
                | QuickEntrypoint::ReadBarrierForRootSlow
        )
    }
}

/// Offset of the mark entrypoint for a reference held in core register `reg`.
pub fn read_barrier_mark_entrypoint_offset(reg: u8) -> i32 {
    thread::READ_BARRIER_MARK_ENTRYPOINTS_OFFSET + reg as i32 * POINTER_SIZE as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entrypoint_offsets() {
        assert_eq!(QuickEntrypoint::AllocObjectResolved.offset(), 128);
        assert_eq!(QuickEntrypoint::AllocObjectInitialized.offset(), 132);
        assert!(QuickEntrypoint::TestSuspend.needs_safepoint());
        assert!(!QuickEntrypoint::Ldiv.needs_safepoint());
        assert_eq!(QuickEntrypoint::try_from(22u8).unwrap(), QuickEntrypoint::TestSuspend);
    }

    #[test]
    fn test_array_data_offset() {
        assert_eq!(object::array_data_offset(0), 12);
        assert_eq!(object::array_data_offset(2), 12);
        assert_eq!(object::array_data_offset(3), 16);
    }
}
