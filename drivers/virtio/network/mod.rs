// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the driver for Virtio network card devices, as
//! described in section 5.1 of the Virtio specification, version
//! 1.1.
//!
//! The device has one receive and one transmit virtqueue. The
//! receive ring is kept populated with device-writable frame
//! buffers, which are recycled straight back to the ring once
//! their contents have been copied out. Transmit buffers are
//! drawn from a fixed pool, bounded by a counting semaphore so
//! callers block rather than overrun the ring.

use crate::features::{self, Network};
use crate::os::{OsInterface, Semaphore};
use crate::virtqueue::{Buffer, Virtqueue, VirtqueueError};
use crate::{DeviceError, Driver, InterruptStatus, PhysAddr, Transport};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::cmp::min;
use core::mem::size_of;
use core::ptr;
use log::{debug, error};
use spin::Mutex;

/// The virtqueue index of the receive queue.
///
const RECV_VIRTQUEUE: u16 = 0;

/// The virtqueue index of the transmit queue.
///
const SEND_VIRTQUEUE: u16 = 1;

/// The number of entries in each virtqueue, and therefore the
/// number of frames that can be in flight in each direction.
///
const QUEUE_SIZE: u16 = 4;

/// The size of each frame buffer: a maximal Ethernet frame,
/// plus the packet header that precedes it.
///
const FRAME_BUFFER_SIZE: usize = 1526;

/// The largest Ethernet frame that fits in a frame buffer
/// alongside the packet header.
///
pub const MAX_FRAME_SIZE: usize = FRAME_BUFFER_SIZE - HEADER_SIZE;

// The offset of the MAC address in the device-specific
// configuration area.
//
const MAC_OFFSET: u16 = 0;

const HEADER_SIZE: usize = size_of::<Header>();

bitflags! {
    /// The flags field of a packet [`Header`].
    ///
    struct HeaderFlags: u8 {
        const NONE = 0;

        /// The packet's checksum is incomplete and the device
        /// must finish it.
        const NEEDS_CHECKSUM = 1;

        /// The device has checked the packet's checksum
        /// already.
        const DATA_VALID = 2;
    }
}

// The packet performs no segmentation offload.
//
const GSO_NONE: u8 = 0;

/// The header that precedes every frame exchanged with the
/// device.
///
/// The trailing buffer count field is only present when merged
/// receive buffers have been negotiated, which this driver
/// declines, so it is omitted here.
///
#[derive(Clone, Copy, Debug)]
#[repr(C)]
struct Header {
    flags: u8,
    gso_type: u8,
    header_len: u16,
    gso_size: u16,
    checksum_start: u16,
    checksum_offset: u16,
}

impl Header {
    // write_to serialises the header into the start of the
    // given frame buffer.
    //
    fn write_to(&self, buf: &mut [u8]) {
        buf[0] = self.flags;
        buf[1] = self.gso_type;
        buf[2..4].copy_from_slice(&self.header_len.to_le_bytes());
        buf[4..6].copy_from_slice(&self.gso_size.to_le_bytes());
        buf[6..8].copy_from_slice(&self.checksum_start.to_le_bytes());
        buf[8..10].copy_from_slice(&self.checksum_offset.to_le_bytes());
    }
}

/// Describes an error encountered while using a network card
/// device.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum NetworkError {
    /// The device could not be initialised.
    Device(DeviceError),

    /// The frame is too large to send in one frame buffer.
    FrameTooLarge { len: usize, max: usize },

    /// No transmit buffer became available in time.
    DeviceBusy,

    /// No received frame is waiting.
    NoFrame,

    /// The caller's buffer is too small for the waiting frame,
    /// which has been dropped.
    BufferTooSmall { need: usize, have: usize },

    /// The device returned a completion whose chain head is
    /// outside the descriptor table.
    BadChainHead(u32),

    /// The device returned a completion shorter than a packet
    /// header.
    TruncatedFrame(usize),

    /// A received chain ended before the length the device
    /// claimed for it.
    MissingDescriptor,

    /// A virtqueue operation failed.
    Virtqueue(VirtqueueError),
}

impl From<DeviceError> for NetworkError {
    fn from(err: DeviceError) -> Self {
        NetworkError::Device(err)
    }
}

impl From<VirtqueueError> for NetworkError {
    fn from(err: VirtqueueError) -> Self {
        NetworkError::Virtqueue(err)
    }
}

// The transmit buffer pool. Buffers not in `free` are owned by
// the device until it completes them.
//
struct SendState {
    buffers: Vec<Box<[u8]>>,
    free: Vec<usize>,
}

/// A network card device.
///
pub struct Device {
    driver: Driver,
    os: Arc<dyn OsInterface>,

    // send_semaphore has one permit per transmit buffer, so
    // senders block while the ring is full.
    send_semaphore: Arc<dyn Semaphore>,

    mac: [u8; 6],

    send_state: Mutex<SendState>,

    // The receive buffers are owned here but written by the
    // device; they are only ever accessed through the
    // descriptors that carry their addresses.
    _recv_buffers: Vec<Box<[u8]>>,
}

impl Device {
    /// Initialises the network card attached by `transport`,
    /// leaving it live.
    ///
    /// The device's MAC address is taken from the OS's
    /// configuration for `interface` if it has one, and
    /// written to the device; otherwise the address the device
    /// generated is adopted.
    ///
    pub fn new(
        transport: Arc<dyn Transport>,
        os: Arc<dyn OsInterface>,
        interface: &str,
    ) -> Result<Device, NetworkError> {
        let tables = [
            features::RESERVED_CAPABILITIES,
            features::NETWORK_CAPABILITIES,
        ];

        let mut driver = Driver::new(transport, &tables[..])?;
        driver.init_queue(RECV_VIRTQUEUE, QUEUE_SIZE)?;
        driver.init_queue(SEND_VIRTQUEUE, QUEUE_SIZE)?;

        let mac = match os.mac_address(interface) {
            Some(mac) => {
                for (i, octet) in mac.iter().enumerate() {
                    driver.write_device_config_u8(MAC_OFFSET + i as u16, *octet);
                }

                mac
            }
            None => {
                let mut mac = [0u8; 6];
                for (i, octet) in mac.iter_mut().enumerate() {
                    *octet = driver.read_device_config_u8(MAC_OFFSET + i as u16);
                }

                mac
            }
        };

        // Fill the receive ring before the device goes live, so
        // it can deliver frames from the start.
        let mut recv_buffers = Vec::with_capacity(QUEUE_SIZE as usize);
        for _ in 0..QUEUE_SIZE {
            let buf = vec![0u8; FRAME_BUFFER_SIZE].into_boxed_slice();
            let buffer = Buffer::DeviceCanWrite {
                addr: PhysAddr::new(buf.as_ptr() as u64),
                len: FRAME_BUFFER_SIZE,
            };

            driver.send(RECV_VIRTQUEUE, &[buffer])?;
            recv_buffers.push(buf);
        }

        driver.notify(RECV_VIRTQUEUE);

        let mut send_buffers = Vec::with_capacity(QUEUE_SIZE as usize);
        let mut free = Vec::with_capacity(QUEUE_SIZE as usize);
        for i in 0..QUEUE_SIZE as usize {
            send_buffers.push(vec![0u8; FRAME_BUFFER_SIZE].into_boxed_slice());
            free.push(i);
        }

        driver.driver_ok();
        debug!("network card ready with MAC address {:02x?}.", mac);

        let send_semaphore = os.sema_alloc(QUEUE_SIZE as usize, QUEUE_SIZE as usize);

        Ok(Device {
            driver,
            os,
            send_semaphore,
            mac,
            send_state: Mutex::new(SendState {
                buffers: send_buffers,
                free,
            }),
            _recv_buffers: recv_buffers,
        })
    }

    /// Returns the device's MAC address.
    ///
    pub fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    /// Sends an Ethernet frame, blocking while all transmit
    /// buffers are in flight.
    ///
    pub fn send_frame(&self, frame: &[u8]) -> Result<(), NetworkError> {
        self.send_frame_timeout(frame, None)
    }

    /// Sends an Ethernet frame, blocking for at most `timeout`
    /// OS ticks while all transmit buffers are in flight.
    ///
    pub fn send_frame_timeout(
        &self,
        frame: &[u8],
        timeout: Option<u64>,
    ) -> Result<(), NetworkError> {
        if !self.send_semaphore.take(timeout) {
            return Err(NetworkError::DeviceBusy);
        }

        if frame.len() > MAX_FRAME_SIZE {
            self.send_semaphore.give();
            return Err(NetworkError::FrameTooLarge {
                len: frame.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        let token = self.os.irq_lock();
        let result = self.queue_frame(frame);
        self.os.irq_unlock(token);

        if result.is_err() {
            self.send_semaphore.give();
        }

        result
    }

    // queue_frame copies the frame into a free transmit buffer
    // and hands it to the device.
    //
    fn queue_frame(&self, frame: &[u8]) -> Result<(), NetworkError> {
        let mut send = self.send_state.lock();
        let index = match send.free.pop() {
            Some(index) => index,
            None => return Err(NetworkError::DeviceBusy),
        };

        let header = Header {
            flags: HeaderFlags::NEEDS_CHECKSUM.bits(),
            gso_type: GSO_NONE,
            header_len: 0,
            gso_size: 0,
            checksum_start: 0,
            // The checksum field sits in the last two bytes of
            // the frame.
            checksum_offset: (frame.len() as u16).saturating_sub(2),
        };

        let buf = &mut send.buffers[index];
        header.write_to(&mut buf[..HEADER_SIZE]);
        buf[HEADER_SIZE..HEADER_SIZE + frame.len()].copy_from_slice(frame);

        let buffer = Buffer::DeviceCanRead {
            addr: PhysAddr::new(buf.as_ptr() as u64),
            len: HEADER_SIZE + frame.len(),
        };

        if let Err(err) = self.driver.send(SEND_VIRTQUEUE, &[buffer]) {
            send.free.push(index);
            return Err(err.into());
        }

        drop(send);
        self.driver.notify(SEND_VIRTQUEUE);

        Ok(())
    }

    /// Reclaims one transmitted frame buffer, if the device has
    /// finished with one, releasing its permit to the next
    /// sender.
    ///
    /// Called once per transmit completion, normally from the
    /// device's interrupt handler.
    ///
    pub fn reclaim_send_buffer(&self) {
        let mut send = self.send_state.lock();
        let elem = match self.driver.recv(SEND_VIRTQUEUE) {
            Some(elem) => elem,
            None => return,
        };

        // A head outside the descriptor table cannot be
        // trusted, but the completion still stands for one
        // transmitted buffer: free a clamped chain and return
        // the permit, or the pool shrinks with every bad id.
        if elem.id as usize >= QUEUE_SIZE as usize {
            error!("network card completed transmit chain {}, which does not exist.", elem.id);
        }

        let head = (elem.id % QUEUE_SIZE as u32) as u16;
        let addr = self
            .driver
            .with_queue(SEND_VIRTQUEUE, |queue| queue.descriptor(head).addr());

        if let Some(index) = send
            .buffers
            .iter()
            .position(|buf| buf.as_ptr() as u64 == addr.as_u64())
        {
            send.free.push(index);
        }

        self.driver.free_chain(SEND_VIRTQUEUE, head);
        self.send_semaphore.give();
    }

    /// Returns whether a received frame is waiting to be read.
    ///
    pub fn frame_waiting(&self) -> bool {
        let token = self.os.irq_lock();
        let waiting = self
            .driver
            .with_queue(RECV_VIRTQUEUE, |queue| queue.has_completed());
        self.os.irq_unlock(token);

        waiting
    }

    /// Copies the oldest waiting received frame into `buf`,
    /// returning its length.
    ///
    /// The frame's buffers are returned to the receive ring
    /// whether or not the read succeeds; a frame that cannot be
    /// delivered is dropped, not left waiting.
    ///
    pub fn recv_frame(&self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        let token = self.os.irq_lock();
        let result = self
            .driver
            .with_queue(RECV_VIRTQUEUE, |queue| read_frame(queue, buf));
        self.os.irq_unlock(token);

        result
    }

    /// Drops the oldest waiting received frame, if any,
    /// returning whether one was dropped.
    ///
    pub fn discard_frame(&self) -> bool {
        let token = self.os.irq_lock();
        let discarded = self.driver.with_queue(RECV_VIRTQUEUE, |queue| {
            match queue.poll_completed() {
                Some(elem) => {
                    let size = queue.num_descriptors() as u32;
                    recycle_chain(queue, (elem.id % size) as u16);
                    true
                }
                None => false,
            }
        });
        self.os.irq_unlock(token);

        discarded
    }

    /// Reads and acknowledges the device's interrupt status,
    /// allowing it to raise further interrupts.
    ///
    pub fn acknowledge_interrupt(&self) -> InterruptStatus {
        let status = self.driver.interrupt_status();
        self.driver.ack_interrupt(status);

        status
    }

    /// Returns the feature set agreed with the device, for use
    /// with [`features::Network`].
    ///
    pub fn features(&self) -> Network {
        Network::from_bits_truncate(self.driver.features())
    }
}

// recycle_chain returns every descriptor in the chain starting
// at `head` to the receive ring and notifies the device.
//
fn recycle_chain(queue: &mut Virtqueue, head: u16) {
    let mut index = head;
    for _ in 0..queue.num_descriptors() {
        let desc = queue.descriptor(index);
        queue.recycle(index);
        if !desc.has_next() {
            break;
        }

        index = desc.next();
    }

    queue.notify();
}

// read_frame consumes the oldest waiting completion on the
// receive queue, copying the frame it carries (without its
// packet header) into `buf`.
//
fn read_frame(queue: &mut Virtqueue, buf: &mut [u8]) -> Result<usize, NetworkError> {
    let elem = match queue.poll_completed() {
        Some(elem) => elem,
        None => return Err(NetworkError::NoFrame),
    };

    let size = queue.num_descriptors() as u32;
    if elem.id >= size {
        error!("network card completed receive chain {}, which does not exist.", elem.id);
        // Keep the ring populated, even though the head cannot
        // be trusted.
        queue.recycle((elem.id % size) as u16);
        queue.notify();
        return Err(NetworkError::BadChainHead(elem.id));
    }

    let head = elem.id as u16;
    let total = elem.len as usize;
    if total < HEADER_SIZE {
        queue.recycle(head);
        queue.notify();
        return Err(NetworkError::TruncatedFrame(total));
    }

    let frame_len = total - HEADER_SIZE;
    if frame_len > buf.len() {
        // Drop the frame without a partial copy.
        recycle_chain(queue, head);
        return Err(NetworkError::BufferTooSmall {
            need: frame_len,
            have: buf.len(),
        });
    }

    // Copy the frame out of the chain, skipping the packet
    // header, and recycle each descriptor as it is drained.
    let mut skip = HEADER_SIZE;
    let mut copied = 0usize;
    let mut remaining = total;
    let mut index = head;
    loop {
        let desc = queue.descriptor(index);
        let take = min(desc.len(), remaining);
        let start = min(skip, take);
        skip -= start;

        let len = take - start;
        if len > 0 {
            let from = (desc.addr().as_u64() as usize + start) as *const u8;
            unsafe { ptr::copy(from, buf[copied..].as_mut_ptr(), len) };
            copied += len;
        }

        remaining -= take;
        queue.recycle(index);

        if remaining == 0 {
            break;
        }

        if !desc.has_next() {
            queue.notify();
            return Err(NetworkError::MissingDescriptor);
        }

        index = desc.next();
    }

    queue.notify();

    Ok(copied)
}
