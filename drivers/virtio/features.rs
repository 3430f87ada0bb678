// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Describes the features a Virtio device can offer and the subset
//! the drivers are able to accept.
//!
//! Feature negotiation is table-driven: each driver passes a list of
//! [`Capability`] tables to [`Driver::new`](crate::Driver::new),
//! which compares them against the bits the device offers. A bit
//! the device offers but no table describes is logged and refused.

use bitflags::bitflags;
use log::debug;

bitflags! {
    /// The feature bits reserved for all Virtio devices,
    /// independently of the device type.
    ///
    pub struct Reserved: u64 {
        /// The device accepts a notification for a virtqueue even
        /// when that queue has no available buffers.
        const NOTIFY_ON_EMPTY = 1 << 24;

        /// The device accepts arbitrary descriptor layouts.
        const ANY_LAYOUT = 1 << 27;

        /// The driver can use descriptors with the INDIRECT flag
        /// set.
        const RING_INDIRECT_DESC = 1 << 28;

        /// The `used_event` and `avail_event` fields suppress
        /// notifications.
        const RING_EVENT_IDX = 1 << 29;

        /// Unused, reserved bit.
        const UNUSED = 1 << 30;

        /// The device complies with Virtio version 1, rather than
        /// operating as a legacy device.
        const VERSION_1 = 1 << 32;

        /// The device can be used on a platform where the device
        /// has limited or translated access to memory.
        const ACCESS_PLATFORM = 1 << 33;

        /// The driver supports the packed virtqueue layout.
        const RING_PACKED = 1 << 34;

        /// The driver uses buffers in the order in which they were
        /// made available.
        const IN_ORDER = 1 << 35;

        /// Memory accesses by the device need platform-specific
        /// ordering, rather than Virtio's default.
        const ORDER_PLATFORM = 1 << 36;
    }
}

bitflags! {
    /// The feature bits specific to network card devices.
    ///
    pub struct Network: u64 {
        /// The device handles packets with a partial checksum.
        const CSUM = 1 << 0;

        /// The driver handles packets with a partial checksum.
        const GUEST_CSUM = 1 << 1;

        /// The device reports its maximum MTU in the config area.
        const MTU = 1 << 3;

        /// The device has a MAC address in the config area.
        const MAC = 1 << 5;

        /// The driver can merge receive buffers.
        const MRG_RXBUF = 1 << 15;

        /// The config area has a status field.
        const STATUS = 1 << 16;

        /// The device has a control virtqueue.
        const CTRL_VQ = 1 << 17;
    }
}

bitflags! {
    /// The feature bits specific to console devices.
    ///
    pub struct Console: u64 {
        /// The config area contains the console dimensions.
        const SIZE = 1 << 0;

        /// The device supports multiple ports over a control
        /// virtqueue.
        const MULTIPORT = 1 << 1;

        /// The config area contains an emergency write register.
        const EMERG_WRITE = 1 << 2;
    }
}

/// Describes one feature bit a device may offer and whether the
/// drivers support it.
///
pub struct Capability {
    /// The feature's name, used in log messages.
    pub name: &'static str,

    /// The feature bit.
    pub bit: u64,

    /// Whether the drivers accept the feature if offered.
    pub supported: bool,
}

/// The capabilities common to all device types.
///
pub const RESERVED_CAPABILITIES: &[Capability] = &[
    Capability {
        name: "NOTIFY_ON_EMPTY",
        bit: Reserved::NOTIFY_ON_EMPTY.bits(),
        supported: false,
    },
    Capability {
        name: "ANY_LAYOUT",
        bit: Reserved::ANY_LAYOUT.bits(),
        supported: false,
    },
    Capability {
        name: "RING_INDIRECT_DESC",
        bit: Reserved::RING_INDIRECT_DESC.bits(),
        supported: false,
    },
    Capability {
        name: "RING_EVENT_IDX",
        bit: Reserved::RING_EVENT_IDX.bits(),
        supported: false,
    },
    Capability {
        name: "UNUSED",
        bit: Reserved::UNUSED.bits(),
        supported: false,
    },
    Capability {
        name: "VERSION_1",
        bit: Reserved::VERSION_1.bits(),
        supported: true,
    },
];

/// The capabilities of network card devices.
///
pub const NETWORK_CAPABILITIES: &[Capability] = &[
    Capability {
        name: "CSUM",
        bit: Network::CSUM.bits(),
        supported: true,
    },
    Capability {
        name: "GUEST_CSUM",
        bit: Network::GUEST_CSUM.bits(),
        supported: false,
    },
    Capability {
        name: "MTU",
        bit: Network::MTU.bits(),
        supported: false,
    },
    Capability {
        name: "MAC",
        bit: Network::MAC.bits(),
        supported: true,
    },
    Capability {
        name: "MRG_RXBUF",
        bit: Network::MRG_RXBUF.bits(),
        supported: false,
    },
    Capability {
        name: "STATUS",
        bit: Network::STATUS.bits(),
        supported: false,
    },
    Capability {
        name: "CTRL_VQ",
        bit: Network::CTRL_VQ.bits(),
        supported: false,
    },
];

/// The capabilities of console devices.
///
pub const CONSOLE_CAPABILITIES: &[Capability] = &[
    Capability {
        name: "SIZE",
        bit: Console::SIZE.bits(),
        supported: true,
    },
    Capability {
        name: "MULTIPORT",
        bit: Console::MULTIPORT.bits(),
        supported: true,
    },
    Capability {
        name: "EMERG_WRITE",
        bit: Console::EMERG_WRITE.bits(),
        supported: true,
    },
];

/// Compares the feature bits in `offered` against one capability
/// table, accumulating the bits we accept into `accepted`.
///
/// Bits described by the table are cleared from `offered`, whether
/// or not they are accepted, so the caller can detect bits no table
/// describes.
///
pub fn match_capabilities(offered: &mut u64, accepted: &mut u64, table: &[Capability]) {
    for capability in table {
        if *offered & capability.bit == 0 {
            continue;
        }

        if capability.supported {
            debug!("accepting feature {}.", capability.name);
            *accepted |= capability.bit;
        } else {
            debug!("declining unsupported feature {}.", capability.name);
        }

        *offered &= !capability.bit;
    }
}
