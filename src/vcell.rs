//! Volatile storage for memory the DMA controller reads and writes behind
//! the compiler's back
//!
//! Field access goes through `read()` / `write()`, which is the shape the
//! `ral-registers` macros expect.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    #[inline]
    pub fn read(&self) -> T {
        // Safety: the cell owns its storage; volatile keeps the access
        // ordered with respect to DMA channel enables.
        unsafe { self.0.get().read_volatile() }
    }

    #[inline]
    pub fn write(&self, val: T) {
        // Safety: see read(). Descriptors are not Sync, so there is a
        // single execution context writing them.
        unsafe { self.0.get().write_volatile(val) }
    }
}
