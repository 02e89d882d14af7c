//! Raw buffer views handed to extensions.

use std::ptr;

/// Byte written over debug shadow buffers once they are released.
pub const POISON: u8 = 0xDB;

/// View of an object's bytes, valid until released through `BufferRelease`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawBuffer {
    pub ptr: *const u8,
    pub len: usize,
    /// Host bookkeeping key; zero means "not acquired".
    pub token: u64,
}

impl RawBuffer {
    pub const EMPTY: RawBuffer = RawBuffer {
        ptr: ptr::null(),
        len: 0,
        token: 0,
    };

    pub fn is_acquired(&self) -> bool {
        self.token != 0
    }

    /// # Safety
    ///
    /// The buffer must not have been released and `ptr`/`len` must be the values the host
    /// handed out.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.ptr.is_null() || self.len == 0 {
            return &[];
        }
        std::slice::from_raw_parts(self.ptr, self.len)
    }
}
