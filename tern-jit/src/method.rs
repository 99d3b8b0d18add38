use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

pub const ACC_PUBLIC: u32 = 0x0001;
pub const ACC_STATIC: u32 = 0x0008;
pub const ACC_SYNCHRONIZED: u32 = 0x0020;
pub const ACC_NATIVE: u32 = 0x0100;
pub const ACC_FAST_NATIVE: u32 = 0x0008_0000;
pub const ACC_CRITICAL_NATIVE: u32 = 0x0020_0000;

/// Flags that change the code of a JNI stub.
const JNI_STUB_FLAGS: u32 = ACC_STATIC | ACC_SYNCHRONIZED | ACC_FAST_NATIVE | ACC_CRITICAL_NATIVE;

pub type MethodRef = Arc<ArtMethod>;

/// The runtime's view of a method as far as the code cache is concerned.
/// Methods are identified by address, like the `ArtMethod*` stored in the
/// zygote map.
pub struct ArtMethod {
    name: String,
    shorty: String,
    access_flags: u32,
    declaring_class: u32,
    class_initialized: AtomicBool,
    entry_point: AtomicUsize,
}

impl ArtMethod {
    pub fn new(name: &str, shorty: &str, access_flags: u32, declaring_class: u32, entry_point: usize) -> MethodRef {
        Arc::new(ArtMethod {
            name: name.into(),
            shorty: shorty.into(),
            access_flags,
            declaring_class,
            class_initialized: AtomicBool::new(true),
            entry_point: AtomicUsize::new(entry_point),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shorty(&self) -> &str {
        &self.shorty
    }

    pub fn access_flags(&self) -> u32 {
        self.access_flags
    }

    pub fn declaring_class(&self) -> u32 {
        self.declaring_class
    }

    pub fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }

    pub fn key(&self) -> usize {
        self as *const ArtMethod as usize
    }

    pub fn jni_stub_key(&self) -> JniStubKey {
        JniStubKey {
            shorty: self.shorty.clone(),
            flags: self.access_flags & JNI_STUB_FLAGS,
        }
    }

    pub fn set_class_initialized(&self, initialized: bool) {
        self.class_initialized.store(initialized, Ordering::Release);
    }

    /// Static methods must not be entered before their class is
    /// initialized; their entrypoint stays on the resolution stub.
    pub fn needs_clinit_check_before_call(&self) -> bool {
        self.is_static() && !self.class_initialized.load(Ordering::Acquire)
    }

    pub fn entry_point(&self) -> usize {
        self.entry_point.load(Ordering::Acquire)
    }

    /// Publishing an entrypoint releases the code and stack map behind it.
    pub fn set_entry_point(&self, entry_point: usize) {
        self.entry_point.store(entry_point, Ordering::Release);
    }
}

impl fmt::Debug for ArtMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})@{:#x}", self.name, self.shorty, self.key())
    }
}

/// Native methods with the same shorty and stub-relevant flags share one
/// JNI stub.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct JniStubKey {
    pub shorty: String,
    pub flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jni_stub_key_ignores_unrelated_flags() {
        let a = ArtMethod::new("a", "VI", ACC_NATIVE | ACC_PUBLIC, 1, 0);
        let b = ArtMethod::new("b", "VI", ACC_NATIVE, 2, 0);
        let c = ArtMethod::new("c", "VI", ACC_NATIVE | ACC_STATIC, 2, 0);
        assert_eq!(a.jni_stub_key(), b.jni_stub_key());
        assert_ne!(a.jni_stub_key(), c.jni_stub_key());
    }

    #[test]
    fn test_clinit_check() {
        let m = ArtMethod::new("s", "V", ACC_STATIC, 1, 0);
        assert!(!m.needs_clinit_check_before_call());
        m.set_class_initialized(false);
        assert!(m.needs_clinit_check_before_call());
    }
}
