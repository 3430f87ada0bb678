// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements split virtqueues, as described in section 2.6 of
//! the Virtio specification, version 1.1.

use super::{Buffer, Descriptor, DescriptorFlags, UsedElem, VirtqueueError, PAGE_SIZE};
use crate::{DeviceError, PhysAddr, Transport};
use alloc::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::min;
use core::mem::size_of;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

// align_up aligns the given offset upwards to the next multiple
// of `align`, which must be a power of two.
//
fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

// Arena owns the single zeroed allocation that holds all three
// rings of a virtqueue.
//
struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

impl Arena {
    // allocate returns a zeroed arena of `size` bytes, aligned
    // to a page boundary as required for the descriptor table.
    //
    fn allocate(size: usize) -> Arena {
        let layout = match Layout::from_size_align(size, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("invalid virtqueue arena size {}", size),
        };

        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            handle_alloc_error(layout);
        }

        Arena { ptr, layout }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// A split virtqueue and the driver-side state needed to use it.
///
/// A `Virtqueue` owns the memory backing its rings. While the
/// queue is ready, the device reads and writes that memory by
/// DMA, so all ring access is volatile and separated from the
/// index updates by fences.
///
pub struct Virtqueue {
    // queue_index is this queue's index with the device.
    queue_index: u16,

    // transport is the transport the device is attached by.
    transport: Arc<dyn Transport>,

    // size is the number of entries in each ring. Always a
    // power of two.
    size: u16,

    // arena holds the memory backing the rings. Kept so the
    // memory is freed when the queue is dropped.
    _arena: Arena,

    // descriptors points to the descriptor table.
    descriptors: *mut Descriptor,

    // avail_idx points to the index field of the available
    // ring. Only the driver writes it.
    avail_idx: *mut u16,

    // avail_ring points to the first entry of the available
    // ring.
    avail_ring: *mut u16,

    // used_idx points to the index field of the used ring.
    // Only the device writes it.
    used_idx: *const u16,

    // used_ring points to the first entry of the used ring.
    used_ring: *const UsedElem,

    // free_list holds the indices of the descriptors not
    // currently owned by the device.
    free_list: Vec<u16>,

    // last_seen is the consumption cursor into the used ring.
    // It runs one ahead of the number of entries consumed, so
    // entries are pending while last_seen - 1 differs from the
    // device's used index.
    last_seen: u16,
}

// The raw pointers all point into the owned arena, so moving
// the queue to another thread moves the memory they point to
// along with them.
unsafe impl Send for Virtqueue {}

impl Virtqueue {
    /// Allocates a virtqueue with `size` entries and registers
    /// it with the device as queue `queue_index`.
    ///
    /// The three rings are laid out contiguously in one zeroed,
    /// page-aligned allocation, in the order and with the
    /// alignments the Virtio specification requires.
    ///
    pub(crate) fn new(
        queue_index: u16,
        transport: Arc<dyn Transport>,
        size: u16,
    ) -> Result<Virtqueue, DeviceError> {
        if size == 0 || !size.is_power_of_two() {
            return Err(DeviceError::BadQueueSize(size));
        }

        transport.select_queue(queue_index);
        if transport.queue_ready() {
            return Err(DeviceError::QueueInUse(queue_index));
        }

        let max = transport.max_queue_size();
        if max == 0 || (size as u32) > max {
            return Err(DeviceError::QueueTooLarge {
                requested: size,
                max,
            });
        }

        transport.set_queue_size(size);

        let num = size as usize;
        let desc_offset = 0;
        let desc_len = size_of::<Descriptor>() * num;
        let avail_offset = align_up(desc_offset + desc_len, 2);
        let avail_len = 6 + 2 * num;
        let used_offset = align_up(avail_offset + avail_len, 4);
        let used_len = 6 + 8 * num;

        let arena = Arena::allocate(used_offset + used_len);
        let base = arena.ptr as usize;
        let avail_base = base + avail_offset;
        let used_base = base + used_offset;

        transport.set_queue_descriptor_area(PhysAddr::new(base as u64));
        transport.set_queue_driver_area(PhysAddr::new(avail_base as u64));
        transport.set_queue_device_area(PhysAddr::new(used_base as u64));
        transport.set_queue_ready();

        Ok(Virtqueue {
            queue_index,
            transport,
            size,
            _arena: arena,
            descriptors: base as *mut Descriptor,
            avail_idx: (avail_base + 2) as *mut u16,
            avail_ring: (avail_base + 4) as *mut u16,
            used_idx: (used_base + 2) as *const u16,
            used_ring: (used_base + 4) as *const UsedElem,
            free_list: (0..size).rev().collect(),
            last_seen: 1,
        })
    }

    /// Returns the number of entries in each ring.
    ///
    pub fn num_descriptors(&self) -> usize {
        self.size as usize
    }

    /// Returns the number of descriptors not currently owned
    /// by the device.
    ///
    pub fn num_free(&self) -> usize {
        self.free_list.len()
    }

    /// Makes the given buffers available to the device as a
    /// single descriptor chain, returning the index of the head
    /// descriptor.
    ///
    /// Buffers larger than [`PAGE_SIZE`] are broken into
    /// page-sized chunks, each occupying one descriptor. The
    /// chain is published atomically: either all descriptors
    /// are made available, or none are and an error is
    /// returned.
    ///
    /// The device is not notified; call
    /// [`notify`](Virtqueue::notify) once one or more chains
    /// have been published.
    ///
    pub fn publish(&mut self, buffers: &[Buffer]) -> Result<u16, VirtqueueError> {
        let mut chunks = Vec::new();
        for buffer in buffers {
            let (addr, len, writable) = match *buffer {
                Buffer::DeviceCanRead { addr, len } => (addr, len, false),
                Buffer::DeviceCanWrite { addr, len } => (addr, len, true),
            };

            let mut offset = 0;
            while offset < len {
                let chunk = min(PAGE_SIZE, len - offset);
                chunks.push((addr.as_u64() + offset as u64, chunk as u32, writable));
                offset += chunk;
            }
        }

        if chunks.is_empty() || chunks.len() > self.free_list.len() {
            return Err(VirtqueueError::NoDescriptors);
        }

        let mut indices = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            // Cannot fail; the length was checked above.
            match self.free_list.pop() {
                Some(index) => indices.push(index),
                None => return Err(VirtqueueError::NoDescriptors),
            }
        }

        for (i, &(addr, len, writable)) in chunks.iter().enumerate() {
            let mut flags = if writable {
                DescriptorFlags::WRITE
            } else {
                DescriptorFlags::NONE
            };

            let mut next = 0u16;
            if i + 1 < indices.len() {
                flags |= DescriptorFlags::NEXT;
                next = indices[i + 1];
            }

            let desc = Descriptor {
                addr: addr.to_le(),
                len: len.to_le(),
                flags: flags.bits().to_le(),
                next: next.to_le(),
            };

            unsafe { ptr::write_volatile(self.descriptors.add(indices[i] as usize), desc) };
        }

        let head = indices[0];
        self.push_avail(head);

        Ok(head)
    }

    // push_avail publishes the descriptor chain starting at
    // `head` in the available ring.
    //
    fn push_avail(&mut self, head: u16) {
        let idx = u16::from_le(unsafe { ptr::read_volatile(self.avail_idx) });
        let slot = (idx % self.size) as usize;
        unsafe { ptr::write_volatile(self.avail_ring.add(slot), head.to_le()) };

        // The device must not observe the new index before the
        // ring entry it covers.
        fence(Ordering::Release);

        unsafe { ptr::write_volatile(self.avail_idx, idx.wrapping_add(1).to_le()) };
    }

    /// Notifies the device that descriptors are waiting in the
    /// available ring.
    ///
    pub fn notify(&self) {
        fence(Ordering::Release);
        self.transport.notify_queue(self.queue_index);
    }

    /// Returns whether the device has returned at least one
    /// descriptor chain the driver has not yet consumed.
    ///
    pub fn has_completed(&self) -> bool {
        let used = u16::from_le(unsafe { ptr::read_volatile(self.used_idx) });
        self.last_seen.wrapping_sub(1) != used
    }

    /// Consumes and returns the oldest used ring entry the
    /// driver has not yet seen, or `None` if the device has
    /// returned nothing new.
    ///
    /// The descriptors in the returned chain still belong to
    /// the driver's in-flight set; pass them back to the free
    /// list with [`free_chain`](Virtqueue::free_chain) or to
    /// the device with [`recycle`](Virtqueue::recycle).
    ///
    pub fn poll_completed(&mut self) -> Option<UsedElem> {
        if !self.has_completed() {
            return None;
        }

        // The entry must not be read before the index that
        // covers it.
        fence(Ordering::Acquire);

        let slot = (self.last_seen.wrapping_sub(1) % self.size) as usize;
        let elem = unsafe { ptr::read_volatile(self.used_ring.add(slot)) };
        self.last_seen = self.last_seen.wrapping_add(1);

        Some(UsedElem {
            id: u32::from_le(elem.id),
            len: u32::from_le(elem.len),
        })
    }

    /// Returns a copy of the descriptor at the given index.
    ///
    /// Indices outside the table are reduced modulo the queue
    /// size, as they may come from a misbehaving device.
    ///
    pub fn descriptor(&self, index: u16) -> Descriptor {
        let index = index % self.size;
        unsafe { ptr::read_volatile(self.descriptors.add(index as usize)) }
    }

    /// Returns a consumed descriptor straight to the available
    /// ring as a device-writable buffer, without changing the
    /// buffer it describes.
    ///
    /// Used by receive paths to keep their rings populated.
    /// The device is not notified.
    ///
    pub fn recycle(&mut self, index: u16) {
        let index = index % self.size;
        unsafe {
            let entry = self.descriptors.add(index as usize);
            let mut desc = ptr::read_volatile(entry);
            desc.flags = DescriptorFlags::WRITE.bits().to_le();
            desc.next = 0;
            ptr::write_volatile(entry, desc);
        }

        self.push_avail(index);
    }

    /// Returns the descriptor chain starting at `head` to the
    /// free list.
    ///
    pub fn free_chain(&mut self, head: u16) {
        let mut index = head % self.size;
        // Bounded so a cyclic chain cannot loop forever.
        for _ in 0..self.size {
            let desc = self.descriptor(index);
            self.free_list.push(index);
            if !desc.has_next() {
                break;
            }

            index = desc.next() % self.size;
        }
    }
}
