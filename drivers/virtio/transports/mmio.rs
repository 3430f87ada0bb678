// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements the memory-mapped Virtio transport, as described
//! in section 4.2 of the Virtio specification, version 1.1.
//!
//! The device's registers occupy a fixed-layout window of at
//! least `0x100` bytes, followed by the device-specific
//! configuration area. Only version 2 of the register layout
//! (the non-legacy interface) is supported.

use crate::{DeviceId, DeviceStatus, InterruptStatus, PhysAddr};
use mmio::Region;

/// The value of the magic value register on any Virtio MMIO
/// device.
///
pub const MAGIC_VALUE: u32 = 0x7472_6976;

// The version of the register layout this transport drives.
//
const VERSION_MODERN: u32 = 2;

// The byte offsets of the MMIO registers.
//
const MAGIC_VALUE_OFFSET: usize = 0x000;
const VERSION_OFFSET: usize = 0x004;
const DEVICE_ID_OFFSET: usize = 0x008;
const DEVICE_FEATURES_OFFSET: usize = 0x010;
const DEVICE_FEATURES_SEL_OFFSET: usize = 0x014;
const DRIVER_FEATURES_OFFSET: usize = 0x020;
const DRIVER_FEATURES_SEL_OFFSET: usize = 0x024;
const QUEUE_SEL_OFFSET: usize = 0x030;
const QUEUE_NUM_MAX_OFFSET: usize = 0x034;
const QUEUE_NUM_OFFSET: usize = 0x038;
const QUEUE_READY_OFFSET: usize = 0x044;
const QUEUE_NOTIFY_OFFSET: usize = 0x050;
const INTERRUPT_STATUS_OFFSET: usize = 0x060;
const INTERRUPT_ACK_OFFSET: usize = 0x064;
const STATUS_OFFSET: usize = 0x070;
const QUEUE_DESC_LOW_OFFSET: usize = 0x080;
const QUEUE_DESC_HIGH_OFFSET: usize = 0x084;
const QUEUE_DRIVER_LOW_OFFSET: usize = 0x090;
const QUEUE_DRIVER_HIGH_OFFSET: usize = 0x094;
const QUEUE_DEVICE_LOW_OFFSET: usize = 0x0a0;
const QUEUE_DEVICE_HIGH_OFFSET: usize = 0x0a4;
const CONFIG_OFFSET: usize = 0x100;

// split_addr splits a physical address into the low and high
// halves written to a register pair. The high half is zero on
// 32-bit platforms.
//
fn split_addr(addr: PhysAddr) -> (u32, u32) {
    let addr = addr.as_u64();
    (addr as u32, (addr >> 32) as u32)
}

/// Describes an error encountered while probing a Virtio MMIO
/// device.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConfigError {
    /// The magic value register does not identify a Virtio
    /// device. The register's value is included.
    BadMagicValue(u32),

    /// The device uses a register layout version other than 2.
    /// The version found is included.
    UnsupportedVersion(u32),

    /// The device at this address has a different device type
    /// from the one expected.
    WrongDeviceId { want: DeviceId, got: u32 },
}

/// A Virtio device attached via a memory-mapped register
/// window.
///
#[derive(Debug)]
pub struct Transport {
    // region is the device's register window, including the
    // device-specific configuration area.
    region: Region,
}

impl Transport {
    /// Checks the identity registers of the device at `region`,
    /// returning a transport for it if it is a Virtio MMIO
    /// device of the expected type.
    ///
    /// A failed probe performs no writes, leaving the device
    /// untouched for whichever driver does own it.
    ///
    pub fn new(region: Region, want: DeviceId) -> Result<Self, ConfigError> {
        let magic = region.read32(MAGIC_VALUE_OFFSET);
        if magic != MAGIC_VALUE {
            return Err(ConfigError::BadMagicValue(magic));
        }

        let version = region.read32(VERSION_OFFSET);
        if version != VERSION_MODERN {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let got = region.read32(DEVICE_ID_OFFSET);
        if got != want.device_id() {
            return Err(ConfigError::WrongDeviceId { want, got });
        }

        Ok(Transport { region })
    }
}

impl crate::Transport for Transport {
    fn read_device_config_u8(&self, offset: u16) -> u8 {
        self.region.read8(CONFIG_OFFSET + offset as usize)
    }

    fn write_device_config_u8(&self, offset: u16, value: u8) {
        self.region.write8(CONFIG_OFFSET + offset as usize, value);
    }

    fn read_interrupt_status(&self) -> InterruptStatus {
        InterruptStatus::from_bits_truncate(self.region.read32(INTERRUPT_STATUS_OFFSET))
    }

    fn ack_interrupt(&self, status: InterruptStatus) {
        self.region.write32(INTERRUPT_ACK_OFFSET, status.bits());
    }

    fn read_status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.region.read32(STATUS_OFFSET))
    }

    fn write_status(&self, status: DeviceStatus) {
        self.region.write32(STATUS_OFFSET, status.bits());
    }

    fn read_device_features(&self) -> u64 {
        self.region.write32(DEVICE_FEATURES_SEL_OFFSET, 0);
        let low = self.region.read32(DEVICE_FEATURES_OFFSET) as u64;
        self.region.write32(DEVICE_FEATURES_SEL_OFFSET, 1);
        let high = self.region.read32(DEVICE_FEATURES_OFFSET) as u64;

        (high << 32) | low
    }

    fn write_driver_features(&self, features: u64) {
        self.region.write32(DRIVER_FEATURES_SEL_OFFSET, 0);
        self.region.write32(DRIVER_FEATURES_OFFSET, features as u32);
        self.region.write32(DRIVER_FEATURES_SEL_OFFSET, 1);
        self.region
            .write32(DRIVER_FEATURES_OFFSET, (features >> 32) as u32);
    }

    fn select_queue(&self, index: u16) {
        self.region.write32(QUEUE_SEL_OFFSET, index as u32);
    }

    fn queue_ready(&self) -> bool {
        self.region.read32(QUEUE_READY_OFFSET) != 0
    }

    fn set_queue_ready(&self) {
        // The device may start using the queue the moment it is
        // marked ready, so the ring addresses written above must
        // be visible first.
        mmio::access_barrier();
        self.region.write32(QUEUE_READY_OFFSET, 1);
    }

    fn max_queue_size(&self) -> u32 {
        self.region.read32(QUEUE_NUM_MAX_OFFSET)
    }

    fn set_queue_size(&self, size: u16) {
        self.region.write32(QUEUE_NUM_OFFSET, size as u32);
    }

    fn notify_queue(&self, queue: u16) {
        self.region.write32(QUEUE_NOTIFY_OFFSET, queue as u32);
    }

    fn set_queue_descriptor_area(&self, area: PhysAddr) {
        let (low, high) = split_addr(area);
        self.region.write32(QUEUE_DESC_LOW_OFFSET, low);
        self.region.write32(QUEUE_DESC_HIGH_OFFSET, high);
    }

    fn set_queue_driver_area(&self, area: PhysAddr) {
        let (low, high) = split_addr(area);
        self.region.write32(QUEUE_DRIVER_LOW_OFFSET, low);
        self.region.write32(QUEUE_DRIVER_HIGH_OFFSET, high);
    }

    fn set_queue_device_area(&self, area: PhysAddr) {
        let (low, high) = split_addr(area);
        self.region.write32(QUEUE_DEVICE_LOW_OFFSET, low);
        self.region.write32(QUEUE_DEVICE_HIGH_OFFSET, high);
    }
}
