// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements Virtio virtqueues, which are used to exchange
//! buffers of data with Virtio devices.
//!
//! Each virtqueue consists of three rings in driver-allocated
//! memory: the descriptor table, which describes buffers; the
//! driver area (available ring), where the driver publishes
//! chains of descriptors; and the device area (used ring), where
//! the device returns chains it has finished with.

mod split;

pub use split::Virtqueue;

use crate::PhysAddr;
use bitflags::bitflags;

/// The size in bytes of the chunks into which large buffers are
/// broken before being described to the device.
///
pub const PAGE_SIZE: usize = 4096;

/// Describes a buffer to be sent to a Virtio device.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Buffer {
    /// A buffer whose contents the device will read.
    DeviceCanRead { addr: PhysAddr, len: usize },

    /// A buffer into which the device will write.
    DeviceCanWrite { addr: PhysAddr, len: usize },
}

/// An entry in the used ring, identifying a descriptor chain the
/// device has returned to the driver.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct UsedElem {
    /// The index of the head of the returned descriptor chain.
    pub id: u32,

    /// The number of bytes the device wrote into the chain.
    pub len: u32,
}

bitflags! {
    /// The flags field of a descriptor.
    ///
    pub(crate) struct DescriptorFlags: u16 {
        const NONE = 0;

        /// The descriptor continues into the descriptor indicated
        /// by the `next` field.
        const NEXT = 1;

        /// The descriptor describes a buffer the device writes to.
        const WRITE = 2;

        /// The descriptor describes a table of further
        /// descriptors.
        const INDIRECT = 4;
    }
}

/// An entry in the descriptor table, describing one buffer.
///
/// All fields are stored little-endian, as the device sees them.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
pub struct Descriptor {
    pub(crate) addr: u64,
    pub(crate) len: u32,
    pub(crate) flags: u16,
    pub(crate) next: u16,
}

impl Descriptor {
    /// Returns the physical address of the buffer described.
    ///
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(u64::from_le(self.addr))
    }

    /// Returns the length in bytes of the buffer described.
    ///
    pub fn len(&self) -> usize {
        u32::from_le(self.len) as usize
    }

    /// Returns whether the descriptor continues into another.
    ///
    pub fn has_next(&self) -> bool {
        let flags = DescriptorFlags::from_bits_truncate(u16::from_le(self.flags));
        flags.contains(DescriptorFlags::NEXT)
    }

    /// Returns the index of the next descriptor in the chain.
    ///
    /// Only meaningful if [`has_next`](Descriptor::has_next)
    /// returns `true`.
    ///
    pub fn next(&self) -> u16 {
        u16::from_le(self.next)
    }
}

/// Describes an error encountered while exchanging buffers with
/// a device.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum VirtqueueError {
    /// The virtqueue does not have enough free descriptors to
    /// describe the buffers requested.
    NoDescriptors,
}
