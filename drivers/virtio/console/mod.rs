// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the driver for Virtio console devices, as
//! described in section 5.3 of the Virtio specification,
//! version 1.1.
//!
//! The console is driven synchronously: reads and writes are
//! broken into page-sized transfers, each of which blocks until
//! the device completes it. Two ports are opened over the
//! control queues when the device supports multiple ports.

use crate::features::{self, Console};
use crate::virtqueue::{Buffer, UsedElem, Virtqueue, VirtqueueError, PAGE_SIZE};
use crate::{DeviceError, Driver, Transport};
use alloc::sync::Arc;
use core::cmp::min;
use core::hint::spin_loop;
use log::debug;

// The virtqueue indices of the four queues used. The first two
// queue indices belong to port 0's data queues, which this
// driver does not use.
//
const CONTROL_RECV_VIRTQUEUE: u16 = 2;
const CONTROL_SEND_VIRTQUEUE: u16 = 3;
const RECV_VIRTQUEUE: u16 = 4;
const SEND_VIRTQUEUE: u16 = 5;

/// The number of entries in each virtqueue.
///
const QUEUE_SIZE: u16 = 1024;

// The number of ports requested from the device.
//
const NUM_PORTS: u32 = 2;

// The byte offsets of the fields in the device-specific
// configuration area.
//
const COLS_OFFSET: u16 = 0;
const ROWS_OFFSET: u16 = 2;
const MAX_PORTS_OFFSET: u16 = 4;
const EMERG_WRITE_OFFSET: u16 = 8;

// The control message events defined for the console, of which
// only PORT_OPEN is sent here.
//
#[allow(dead_code)]
mod event {
    pub const DEVICE_READY: u16 = 0;
    pub const DEVICE_ADD: u16 = 1;
    pub const DEVICE_REMOVE: u16 = 2;
    pub const PORT_READY: u16 = 3;
    pub const CONSOLE_PORT: u16 = 4;
    pub const RESIZE: u16 = 5;
    pub const PORT_OPEN: u16 = 6;
    pub const PORT_NAME: u16 = 7;
}

// A control queue message.
//
struct Control {
    id: u32,
    event: u16,
    value: u16,
}

impl Control {
    // encode returns the message in its wire format.
    //
    fn encode(&self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..6].copy_from_slice(&self.event.to_le_bytes());
        buf[6..8].copy_from_slice(&self.value.to_le_bytes());

        buf
    }
}

/// Describes an error encountered while using a console
/// device.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConsoleError {
    /// The device could not be initialised.
    Device(DeviceError),

    /// The device completed a write without consuming all of
    /// it.
    ///
    /// The used length of a device-readable chain counts bytes
    /// the device wrote, not bytes it read, so a completed
    /// outbound transfer was consumed in full and a conforming
    /// device never produces this error. It guards the
    /// accounting in [`write`](Device::write).
    ShortWrite { requested: usize, written: usize },

    /// A virtqueue operation failed.
    Virtqueue(VirtqueueError),
}

impl From<DeviceError> for ConsoleError {
    fn from(err: DeviceError) -> Self {
        ConsoleError::Device(err)
    }
}

impl From<VirtqueueError> for ConsoleError {
    fn from(err: VirtqueueError) -> Self {
        ConsoleError::Virtqueue(err)
    }
}

// wait_completed spins until the device completes a transfer
// on the given queue.
//
fn wait_completed(queue: &mut Virtqueue) -> UsedElem {
    loop {
        if let Some(elem) = queue.poll_completed() {
            return elem;
        }

        spin_loop();
    }
}

/// A console device.
///
pub struct Device {
    driver: Driver,
    multiport: bool,
}

impl Device {
    /// Initialises the console attached by `transport`,
    /// leaving it live with its ports open.
    ///
    pub fn new(transport: Arc<dyn Transport>) -> Result<Device, ConsoleError> {
        let tables = [
            features::RESERVED_CAPABILITIES,
            features::CONSOLE_CAPABILITIES,
        ];

        let mut driver = Driver::new(transport, &tables[..])?;

        // Describe the console we want: no size information,
        // two ports, emergency write available.
        write_config_u16(&driver, COLS_OFFSET, 0);
        write_config_u16(&driver, ROWS_OFFSET, 0);
        write_config_u32(&driver, MAX_PORTS_OFFSET, NUM_PORTS);
        write_config_u32(&driver, EMERG_WRITE_OFFSET, 1);

        driver.init_queue(CONTROL_RECV_VIRTQUEUE, QUEUE_SIZE)?;
        driver.init_queue(CONTROL_SEND_VIRTQUEUE, QUEUE_SIZE)?;
        driver.init_queue(RECV_VIRTQUEUE, QUEUE_SIZE)?;
        driver.init_queue(SEND_VIRTQUEUE, QUEUE_SIZE)?;
        driver.driver_ok();

        let multiport = driver.features() & Console::MULTIPORT.bits() != 0;
        let device = Device { driver, multiport };

        device.open_port(0)?;
        if device.multiport {
            device.open_port(1)?;
        }

        debug!("console ready with {} ports.", if device.multiport { 2 } else { 1 });

        Ok(device)
    }

    /// Returns whether the device supports multiple ports.
    ///
    pub fn multiport(&self) -> bool {
        self.multiport
    }

    // open_port announces on both control queues that the
    // given port is open, blocking until the device has seen
    // both messages.
    //
    fn open_port(&self, port: u32) -> Result<(), ConsoleError> {
        let message = Control {
            id: port,
            event: event::PORT_OPEN,
            value: 1,
        }
        .encode();

        self.transfer_out(CONTROL_SEND_VIRTQUEUE, &message[..])?;
        self.transfer_out(CONTROL_RECV_VIRTQUEUE, &message[..])?;

        Ok(())
    }

    /// Writes `buf` to the console, blocking until the device
    /// has consumed it.
    ///
    /// The data is sent in page-sized transfers, each completed
    /// before the next begins.
    ///
    pub fn write(&self, buf: &[u8]) -> Result<usize, ConsoleError> {
        let mut written = 0;
        for chunk in buf.chunks(PAGE_SIZE) {
            written += self.transfer_out(SEND_VIRTQUEUE, chunk)?;
        }

        if written != buf.len() {
            return Err(ConsoleError::ShortWrite {
                requested: buf.len(),
                written,
            });
        }

        Ok(written)
    }

    /// Reads from the console into `buf`, blocking until the
    /// device delivers data.
    ///
    /// At most one page-sized transfer is in flight at a time;
    /// reading stops early once the device delivers less than
    /// was asked of it.
    ///
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, ConsoleError> {
        let mut total = 0;
        for chunk in buf.chunks_mut(PAGE_SIZE) {
            let len = chunk.len();
            let got = self.transfer_in(RECV_VIRTQUEUE, chunk)?;
            total += got;
            if got < len {
                break;
            }
        }

        Ok(total)
    }

    // transfer_out sends one device-readable transfer on the
    // given queue and blocks until it completes. A completion
    // consumes the whole transfer, so the full length is
    // returned; the used length only counts bytes the device
    // wrote.
    //
    fn transfer_out(&self, queue: u16, data: &[u8]) -> Result<usize, ConsoleError> {
        self.driver.with_queue(queue, |virtqueue| {
            let buffer = Buffer::DeviceCanRead {
                addr: crate::PhysAddr::new(data.as_ptr() as u64),
                len: data.len(),
            };

            let head = virtqueue.publish(&[buffer])?;
            virtqueue.notify();
            wait_completed(virtqueue);
            virtqueue.free_chain(head);

            Ok(data.len())
        })
    }

    // transfer_in offers one device-writable transfer on the
    // given queue and blocks until the device fills it,
    // returning the number of bytes delivered.
    //
    fn transfer_in(&self, queue: u16, buf: &mut [u8]) -> Result<usize, ConsoleError> {
        self.driver.with_queue(queue, |virtqueue| {
            let buffer = Buffer::DeviceCanWrite {
                addr: crate::PhysAddr::new(buf.as_ptr() as u64),
                len: buf.len(),
            };

            let head = virtqueue.publish(&[buffer])?;
            virtqueue.notify();
            let elem = wait_completed(virtqueue);
            virtqueue.free_chain(head);

            Ok(min(elem.len as usize, buf.len()))
        })
    }
}

// write_config_u16 writes a 16-bit value to the configuration
// area, least significant byte first.
//
fn write_config_u16(driver: &Driver, offset: u16, value: u16) {
    for (i, octet) in value.to_le_bytes().iter().enumerate() {
        driver.write_device_config_u8(offset + i as u16, *octet);
    }
}

// write_config_u32 writes a 32-bit value to the configuration
// area, least significant byte first.
//
fn write_config_u32(driver: &Driver, offset: u16, value: u32) {
    for (i, octet) in value.to_le_bytes().iter().enumerate() {
        driver.write_device_config_u8(offset + i as u16, *octet);
    }
}
