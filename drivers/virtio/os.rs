// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Defines the interface the drivers need from the host operating
//! system.
//!
//! The drivers never depend on a particular RTOS. Instead, the
//! composition root supplies an implementation of [`OsInterface`],
//! which provides counting semaphores, the interrupt lock and MAC
//! address lookup. Porting the drivers to a new OS means
//! implementing this trait.

use alloc::sync::Arc;

/// A counting semaphore, used by the network driver to bound the
/// number of transmit buffers in flight.
///
pub trait Semaphore: Send + Sync {
    /// Takes one permit, blocking the calling context until one
    /// is available.
    ///
    /// `timeout` is a duration in OS ticks; `None` waits forever.
    /// Returns `false` if the timeout expired before a permit
    /// became available.
    ///
    fn take(&self, timeout: Option<u64>) -> bool;

    /// Releases one permit.
    ///
    fn give(&self);
}

/// The set of OS primitives consumed by the drivers.
///
pub trait OsInterface: Send + Sync {
    /// Allocates a counting semaphore with `slots` permits in
    /// total, of which `available` are available immediately.
    ///
    fn sema_alloc(&self, slots: usize, available: usize) -> Arc<dyn Semaphore>;

    /// Enters an exclusive critical section by disabling the
    /// device's interrupt source, returning a token that must be
    /// passed to [`irq_unlock`](OsInterface::irq_unlock).
    ///
    fn irq_lock(&self) -> usize;

    /// Leaves the critical section entered by the matching
    /// [`irq_lock`](OsInterface::irq_lock).
    ///
    fn irq_unlock(&self, token: usize);

    /// Returns the MAC address configured for the named network
    /// interface, if the OS has one.
    ///
    fn mac_address(&self, interface: &str) -> Option<[u8; 6]>;
}
