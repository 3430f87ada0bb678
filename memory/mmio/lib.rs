// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides functionality for interacting with memory-mapped
//! I/O devices.
//!
//! This crate provides basic but safe support for MMIO register
//! windows. A [`Region`] wraps a fixed block of device registers
//! at a known base address and exposes ordered, volatile accessors
//! so that seemingly idempotent accesses are never removed or
//! rearranged by the compiler.
//!
//! Every access performs bounds checking to ensure that overflows
//! do not occur. An out-of-range or misaligned access is a driver
//! configuration error, so it panics rather than returning an
//! error value.
//!
//! # Examples
//!
//! ```
//! let mut registers = [0u32; 128];
//! let base = registers.as_mut_ptr() as usize;
//! let region = unsafe { mmio::Region::new(base, 0x200) };
//! let magic = region.read32(0x000);
//! region.write32(0x070, 0);
//! mmio::access_barrier();
//! ```

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(deprecated_in_future)]
#![deny(keyword_idents)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

use core::sync::atomic::{fence, Ordering};

/// Ensures that neither the compiler nor the CPU will move any
/// reads or writes from one side of the barrier to the other.
///
/// Sequences that establish ordering between the driver and the
/// device (such as writing a virtqueue's physical addresses and
/// then marking the queue ready) must be separated by this
/// barrier so the device cannot observe a half-written structure.
///
#[inline]
pub fn access_barrier() {
    fence(Ordering::SeqCst);
}

/// Describes a fixed-layout block of device registers at a known
/// base address.
///
/// All register access goes through a `Region`; the register
/// block is never aliased with a normal data structure, which
/// preserves the ordering guarantees volatile access provides.
///
#[derive(Debug)]
pub struct Region {
    // base is the first valid address in the region.
    base: usize,

    // size is the number of addressable bytes in the region.
    size: usize,
}

impl Region {
    /// Returns a region describing `size` bytes of device
    /// registers starting at `base`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the address range is mapped
    /// device memory for the lifetime of the region and that no
    /// other code aliases it as ordinary data.
    ///
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Region { base, size }
    }

    /// Returns the region's base address.
    ///
    pub fn base(&self) -> usize {
        self.base
    }

    /// Returns the number of addressable bytes in the region.
    ///
    pub fn size(&self) -> usize {
        self.size
    }

    // checked_addr returns the address of the given offset,
    // panicking if an access of `width` bytes would exceed the
    // region or be misaligned.
    //
    fn checked_addr(&self, offset: usize, width: usize) -> usize {
        let end = offset.checked_add(width).expect("MMIO offset overflow");
        if end > self.size {
            panic!(
                "MMIO access at offset {:#x} exceeds region of {:#x} bytes",
                offset, self.size
            );
        }

        let addr = self.base.checked_add(offset).expect("MMIO address overflow");
        if addr % width != 0 {
            panic!("misaligned MMIO access at address {:#x}", addr);
        }

        addr
    }

    /// Performs a volatile 32-bit read at the given byte offset.
    ///
    #[inline]
    #[track_caller]
    pub fn read32(&self, offset: usize) -> u32 {
        let addr = self.checked_addr(offset, 4);
        unsafe { core::ptr::read_volatile(addr as *const u32) }
    }

    /// Performs a volatile 32-bit write at the given byte offset.
    ///
    #[inline]
    #[track_caller]
    pub fn write32(&self, offset: usize, value: u32) {
        let addr = self.checked_addr(offset, 4);
        unsafe { core::ptr::write_volatile(addr as *mut u32, value) };
    }

    /// Performs a volatile byte read at the given offset.
    ///
    /// Used for the byte-addressed device-specific configuration
    /// area.
    ///
    #[inline]
    #[track_caller]
    pub fn read8(&self, offset: usize) -> u8 {
        let addr = self.checked_addr(offset, 1);
        unsafe { core::ptr::read_volatile(addr as *const u8) }
    }

    /// Performs a volatile byte write at the given offset.
    ///
    #[inline]
    #[track_caller]
    pub fn write8(&self, offset: usize, value: u8) {
        let addr = self.checked_addr(offset, 1);
        unsafe { core::ptr::write_volatile(addr as *mut u8, value) };
    }
}
