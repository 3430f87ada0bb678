// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements drivers for Virtio devices, as described in the
//! [Virtio specification, version 1.1](https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html).
//!
//! The crate is layered the way the specification is. At the
//! bottom, a [`Transport`] gives access to a device's registers;
//! the [MMIO transport](transports::mmio) is implemented here.
//! On top of that, [`Driver`] performs the device initialisation
//! handshake and owns the device's [virtqueues](virtqueue), which
//! exchange buffers with the device. The [`network`] and
//! [`console`] modules implement the two device types supported.
//!
//! Drivers obtain OS services (semaphores, the interrupt lock,
//! MAC address lookup) through the [`os::OsInterface`] trait, so
//! the crate itself stays independent of the host OS.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::inline_asm_x86_att_syntax)]
#![deny(clippy::missing_panics_doc)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(deprecated_in_future)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(missing_abi)]
#![deny(unused_crate_dependencies)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod console;
pub mod features;
pub mod network;
pub mod os;
pub mod transports;
pub mod virtqueue;

#[cfg(test)]
pub(crate) mod testing;

use crate::features::Capability;
use crate::virtqueue::{Buffer, UsedElem, Virtqueue, VirtqueueError};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bitflags::bitflags;
use log::debug;
use spin::Mutex;

/// A physical memory address, as seen by the device.
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Returns the given physical address.
    ///
    pub const fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a `u64`.
    ///
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

/// The set of Virtio device types.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceId {
    NetworkCard = 1,
    BlockDevice = 2,
    Console = 3,
    EntropySource = 4,
    MemoryBallooning = 5,
    IoMemory = 6,
    Rpmsg = 7,
    ScsiHost = 8,
    Transport9P = 9,
    GpuDevice = 16,
    ClockDevice = 17,
    InputDevice = 18,
    SocketDevice = 19,
    CryptoDevice = 20,
    MemoryDevice = 24,
    SoundDevice = 25,
    FileSystemDevice = 26,
}

impl DeviceId {
    /// Returns the numerical value a device of this type has in
    /// its device id register.
    ///
    pub fn device_id(&self) -> u32 {
        *self as u32
    }
}

bitflags! {
    /// The contents of a device's status register, used in the
    /// initialisation handshake.
    ///
    pub struct DeviceStatus: u32 {
        /// The register's value after a device reset.
        const RESET = 0;

        /// The driver has noticed the device.
        const ACKNOWLEDGE = 1;

        /// The driver knows how to drive the device.
        const DRIVER = 2;

        /// The driver is set up and the device is live.
        const DRIVER_OK = 4;

        /// The driver has finished feature negotiation and the
        /// device has accepted the result.
        const FEATURES_OK = 8;

        /// The device has experienced an error it cannot recover
        /// from without a reset.
        const DEVICE_NEEDS_RESET = 64;

        /// The driver has given up on the device.
        const FAILED = 128;
    }
}

bitflags! {
    /// The contents of a device's interrupt status register,
    /// indicating why the device raised an interrupt.
    ///
    pub struct InterruptStatus: u32 {
        /// The device has returned buffers in at least one used
        /// ring.
        const RING_UPDATE = 1;

        /// The device's configuration area has changed.
        const CONFIG_CHANGED = 2;
    }
}

/// The view of a Virtio device the rest of the crate drives,
/// independently of the transport the device is attached by.
///
pub trait Transport: Send + Sync {
    /// Reads one byte from the device-specific configuration
    /// area.
    fn read_device_config_u8(&self, offset: u16) -> u8;

    /// Writes one byte to the device-specific configuration
    /// area.
    fn write_device_config_u8(&self, offset: u16, value: u8);

    /// Returns the device's interrupt status.
    fn read_interrupt_status(&self) -> InterruptStatus;

    /// Acknowledges the given interrupt causes, allowing the
    /// device to raise further interrupts for them.
    fn ack_interrupt(&self, status: InterruptStatus);

    /// Returns the device's status register.
    fn read_status(&self) -> DeviceStatus;

    /// Writes the device's status register. Writing
    /// [`DeviceStatus::RESET`] resets the device.
    fn write_status(&self, status: DeviceStatus);

    /// Returns the full 64-bit feature set the device offers.
    fn read_device_features(&self) -> u64;

    /// Informs the device of the feature set the driver
    /// accepts.
    fn write_driver_features(&self, features: u64);

    /// Selects the queue the other queue accessors refer to.
    fn select_queue(&self, index: u16);

    /// Returns whether the selected queue is already in use.
    fn queue_ready(&self) -> bool;

    /// Hands the selected queue over to the device. The queue's
    /// size and ring addresses must be set first.
    fn set_queue_ready(&self);

    /// Returns the largest queue size the device supports for
    /// the selected queue, or 0 if the queue does not exist.
    fn max_queue_size(&self) -> u32;

    /// Sets the number of ring entries in the selected queue.
    fn set_queue_size(&self, size: u16);

    /// Notifies the device that queue `queue` has new buffers
    /// in its available ring.
    fn notify_queue(&self, queue: u16);

    /// Sets the physical address of the selected queue's
    /// descriptor table.
    fn set_queue_descriptor_area(&self, area: PhysAddr);

    /// Sets the physical address of the selected queue's
    /// available ring.
    fn set_queue_driver_area(&self, area: PhysAddr);

    /// Sets the physical address of the selected queue's used
    /// ring.
    fn set_queue_device_area(&self, area: PhysAddr);
}

/// Describes an error encountered while initialising a Virtio
/// device.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DeviceError {
    /// The device refused the feature set the driver accepted.
    NegotiationFailed,

    /// The virtqueue with the given index is already in use,
    /// either by this driver or by another.
    QueueInUse(u16),

    /// The device does not support a virtqueue as large as the
    /// driver requested.
    QueueTooLarge { requested: u16, max: u32 },

    /// The requested virtqueue size is not a nonzero power of
    /// two.
    BadQueueSize(u16),
}

/// A Virtio device that has completed feature negotiation,
/// along with the virtqueues used to drive it.
///
pub struct Driver {
    // transport is the transport the device is attached by.
    transport: Arc<dyn Transport>,

    // features is the feature set agreed with the device.
    features: u64,

    // virtqueues contains the queues initialised so far, by
    // queue index.
    virtqueues: BTreeMap<u16, Mutex<Virtqueue>>,
}

impl Driver {
    /// Resets the device and takes it through the
    /// initialisation handshake, up to and including feature
    /// negotiation.
    ///
    /// `capabilities` lists the feature tables to negotiate
    /// with, normally a device type table from [`features`]
    /// plus [`features::RESERVED_CAPABILITIES`].
    ///
    /// On success the device is left one step short of live:
    /// the caller should initialise the virtqueues it needs
    /// with [`init_queue`](Driver::init_queue), then call
    /// [`driver_ok`](Driver::driver_ok).
    ///
    pub fn new(
        transport: Arc<dyn Transport>,
        capabilities: &[&[Capability]],
    ) -> Result<Driver, DeviceError> {
        let mut driver = Driver {
            transport,
            features: 0,
            virtqueues: BTreeMap::new(),
        };

        driver.reset();
        driver.acknowledge();
        driver.load_driver();
        driver.negotiate(capabilities)?;

        Ok(driver)
    }

    /// Resets the device, dropping any prior state.
    ///
    pub fn reset(&self) {
        self.transport.write_status(DeviceStatus::RESET);
    }

    /// Tells the device the driver has noticed it.
    ///
    pub fn acknowledge(&self) {
        self.update_status(DeviceStatus::ACKNOWLEDGE);
    }

    /// Tells the device the driver knows how to drive it.
    ///
    pub fn load_driver(&self) {
        self.update_status(DeviceStatus::DRIVER);
    }

    // update_status sets the given flags in the device's status
    // register, leaving the other flags unchanged.
    //
    fn update_status(&self, flags: DeviceStatus) {
        let status = self.transport.read_status();
        self.transport.write_status(status | flags);
    }

    /// Negotiates the feature set with the device.
    ///
    /// Each bit the device offers is looked up in the given
    /// capability tables and accepted if a table marks it
    /// supported. Offered bits no table describes are declined.
    /// The result only takes effect if the device confirms it
    /// by leaving [`DeviceStatus::FEATURES_OK`] set.
    ///
    pub fn negotiate(&mut self, capabilities: &[&[Capability]]) -> Result<(), DeviceError> {
        let mut offered = self.transport.read_device_features();
        let mut accepted = 0u64;
        for table in capabilities {
            features::match_capabilities(&mut offered, &mut accepted, table);
        }

        if offered != 0 {
            debug!("declining {} undescribed feature bits.", offered.count_ones());
        }

        self.transport.write_driver_features(accepted);
        self.update_status(DeviceStatus::FEATURES_OK);
        if !self
            .transport
            .read_status()
            .contains(DeviceStatus::FEATURES_OK)
        {
            self.transport.write_status(DeviceStatus::FAILED);
            return Err(DeviceError::NegotiationFailed);
        }

        self.features = accepted;

        Ok(())
    }

    /// Returns the feature set agreed with the device.
    ///
    pub fn features(&self) -> u64 {
        self.features
    }

    /// Allocates a virtqueue with `size` entries and registers
    /// it with the device as queue `queue`.
    ///
    pub fn init_queue(&mut self, queue: u16, size: u16) -> Result<(), DeviceError> {
        let virtqueue = Virtqueue::new(queue, self.transport.clone(), size)?;
        self.virtqueues.insert(queue, Mutex::new(virtqueue));

        Ok(())
    }

    /// Tells the device the driver is ready, making the device
    /// live.
    ///
    pub fn driver_ok(&self) {
        self.update_status(DeviceStatus::DRIVER_OK);
    }

    /// Calls `body` with exclusive access to the given
    /// virtqueue.
    ///
    /// Used by device drivers that perform several queue
    /// operations that must not interleave with other users of
    /// the queue.
    ///
    /// # Panics
    ///
    /// `with_queue` panics if the queue has not been set up
    /// with [`init_queue`](Driver::init_queue), as do the
    /// other per-queue methods. That is a driver bug, not a
    /// runtime condition.
    ///
    pub fn with_queue<F, R>(&self, queue: u16, body: F) -> R
    where
        F: FnOnce(&mut Virtqueue) -> R,
    {
        match self.virtqueues.get(&queue) {
            Some(virtqueue) => {
                let mut guard = virtqueue.lock();
                body(&mut guard)
            }
            None => panic!("virtqueue {} used before being initialised", queue),
        }
    }

    /// Makes the given buffers available to the device on the
    /// given queue, returning the head descriptor index. The
    /// device is not notified.
    ///
    pub fn send(&self, queue: u16, buffers: &[Buffer]) -> Result<u16, VirtqueueError> {
        self.with_queue(queue, |virtqueue| virtqueue.publish(buffers))
    }

    /// Notifies the device that the given queue has new buffers
    /// available.
    ///
    pub fn notify(&self, queue: u16) {
        self.with_queue(queue, |virtqueue| virtqueue.notify());
    }

    /// Consumes and returns the oldest unseen completion on the
    /// given queue, if there is one.
    ///
    pub fn recv(&self, queue: u16) -> Option<UsedElem> {
        self.with_queue(queue, |virtqueue| virtqueue.poll_completed())
    }

    /// Returns the given descriptor chain to the queue's free
    /// list.
    ///
    pub fn free_chain(&self, queue: u16, head: u16) {
        self.with_queue(queue, |virtqueue| virtqueue.free_chain(head));
    }

    /// Returns the given descriptor to the queue's available
    /// ring as a device-writable buffer.
    ///
    pub fn recycle(&self, queue: u16, index: u16) {
        self.with_queue(queue, |virtqueue| virtqueue.recycle(index));
    }

    /// Returns the device's interrupt status.
    ///
    pub fn interrupt_status(&self) -> InterruptStatus {
        self.transport.read_interrupt_status()
    }

    /// Acknowledges the given interrupt causes.
    ///
    pub fn ack_interrupt(&self, status: InterruptStatus) {
        self.transport.ack_interrupt(status);
    }

    /// Reads one byte from the device-specific configuration
    /// area.
    ///
    pub fn read_device_config_u8(&self, offset: u16) -> u8 {
        self.transport.read_device_config_u8(offset)
    }

    /// Writes one byte to the device-specific configuration
    /// area.
    ///
    pub fn write_device_config_u8(&self, offset: u16, value: u8) {
        self.transport.write_device_config_u8(offset, value);
    }
}
