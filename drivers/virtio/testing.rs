// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Provides a fake Virtio device and a fake OS for testing the
//! drivers against.
//!
//! [`FakeDevice`] implements [`Transport`], recording the
//! driver's register activity and acting on the virtqueue rings
//! the way a real device would: descriptor chains the device can
//! read are consumed and logged, and chains the device can write
//! are held until data is injected with
//! [`inject`](FakeDevice::inject).

use crate::os::{OsInterface, Semaphore};
use crate::{DeviceId, DeviceStatus, InterruptStatus, PhysAddr, Transport};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{fence, AtomicUsize, Ordering};
use spin::Mutex;

// The device-side state of one virtqueue.
//
struct FakeQueue {
    size: u32,
    ready: bool,
    desc: u64,
    driver: u64,
    device: u64,

    // last_avail is the next available ring slot to scan.
    last_avail: u16,

    // used_count is the number of entries written to the used
    // ring.
    used_count: u16,

    // completed is the number of available chains the device
    // has finished with.
    completed: u16,

    // waiting holds the heads of device-writable chains held
    // until data arrives for them.
    waiting: VecDeque<u16>,
}

impl FakeQueue {
    fn new() -> FakeQueue {
        FakeQueue {
            size: 0,
            ready: false,
            desc: 0,
            driver: 0,
            device: 0,
            last_avail: 0,
            used_count: 0,
            completed: 0,
            waiting: VecDeque::new(),
        }
    }
}

struct State {
    status: u32,
    device_features: u64,
    driver_features: u64,
    queue_sel: u16,
    max_queue_size: u32,
    interrupt_status: u32,
    config: [u8; 64],
    drop_features_ok: bool,
    corrupt_used: BTreeMap<u16, u32>,
    queues: BTreeMap<u16, FakeQueue>,
    pending: BTreeMap<u16, VecDeque<Vec<u8>>>,
    transfers: Vec<(u16, Vec<u8>)>,
}

/// A scripted Virtio device, driven through the [`Transport`]
/// trait.
///
pub(crate) struct FakeDevice {
    state: Mutex<State>,
}

impl FakeDevice {
    /// Returns a fake device of the given type, offering the
    /// given feature set.
    ///
    pub fn new(_device: DeviceId, device_features: u64) -> FakeDevice {
        FakeDevice {
            state: Mutex::new(State {
                status: 0,
                device_features,
                driver_features: 0,
                queue_sel: 0,
                max_queue_size: 4096,
                interrupt_status: 0,
                config: [0u8; 64],
                drop_features_ok: false,
                corrupt_used: BTreeMap::new(),
                queues: BTreeMap::new(),
                pending: BTreeMap::new(),
                transfers: Vec::new(),
            }),
        }
    }

    /// Caps the queue size the device will report for every
    /// queue.
    ///
    pub fn set_max_queue_size(&self, max: u32) {
        self.state.lock().max_queue_size = max;
    }

    /// Makes the device refuse feature negotiation by clearing
    /// FEATURES_OK from any status the driver writes.
    ///
    pub fn set_drop_features_ok(&self, drop: bool) {
        self.state.lock().drop_features_ok = drop;
    }

    /// Returns the device's status register.
    ///
    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.state.lock().status)
    }

    /// Returns the feature set the driver accepted.
    ///
    pub fn driver_features(&self) -> u64 {
        self.state.lock().driver_features
    }

    /// Returns a copy of the device-specific configuration
    /// area.
    ///
    pub fn config(&self) -> [u8; 64] {
        self.state.lock().config
    }

    /// Overwrites part of the device-specific configuration
    /// area, as if set by the device.
    ///
    pub fn set_config(&self, offset: usize, bytes: &[u8]) {
        let mut state = self.state.lock();
        state.config[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Returns the registered ring addresses, size and
    /// readiness of the given queue.
    ///
    pub fn queue_info(&self, queue: u16) -> (u64, u64, u64, u32, bool) {
        let state = self.state.lock();
        match state.queues.get(&queue) {
            Some(q) => (q.desc, q.driver, q.device, q.size, q.ready),
            None => (0, 0, 0, 0, false),
        }
    }

    /// Returns the device-readable transfers consumed so far on
    /// the given queue, oldest first.
    ///
    pub fn transfers(&self, queue: u16) -> Vec<Vec<u8>> {
        let state = self.state.lock();
        state
            .transfers
            .iter()
            .filter(|(from, _)| *from == queue)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Returns all device-readable transfers consumed so far,
    /// across every queue, oldest first.
    ///
    pub fn transfer_log(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().transfers.clone()
    }

    /// Delivers `data` into the next device-writable chain on
    /// the given queue, holding it until one is available.
    ///
    pub fn inject(&self, queue: u16, data: &[u8]) {
        let mut state = self.state.lock();
        state
            .pending
            .entry(queue)
            .or_insert_with(VecDeque::new)
            .push_back(data.to_vec());
        process_queue(&mut state, queue);
    }

    /// Returns the number of chains the driver has made
    /// available on the given queue that the device has not yet
    /// finished with.
    ///
    pub fn available_chains(&self, queue: u16) -> usize {
        let mut state = self.state.lock();
        process_queue(&mut state, queue);
        match state.queues.get(&queue) {
            Some(q) if q.ready && q.driver != 0 => {
                let avail = read_u16(q.driver + 2);
                avail.wrapping_sub(q.completed) as usize
            }
            _ => 0,
        }
    }

    /// Makes the device report the given chain head for the
    /// next chain it consumes on the given queue, as a
    /// misbehaving device might.
    ///
    pub fn set_corrupt_used_id(&self, queue: u16, id: u32) {
        self.state.lock().corrupt_used.insert(queue, id);
    }

    /// Writes a raw entry to the given queue's used ring, as a
    /// misbehaving device might.
    ///
    pub fn push_used(&self, queue: u16, id: u32, len: u32) {
        let mut state = self.state.lock();
        if let Some(q) = state.queues.get_mut(&queue) {
            post_used(q, id, len);
        }

        state.interrupt_status |= InterruptStatus::RING_UPDATE.bits();
    }
}

// read_u16 performs a volatile read of driver-owned ring
// memory.
//
fn read_u16(addr: u64) -> u16 {
    u16::from_le(unsafe { ptr::read_volatile(addr as usize as *const u16) })
}

// read_descriptor reads the descriptor table entry at the given
// index, returning its fields in host byte order.
//
fn read_descriptor(q: &FakeQueue, index: u16) -> (u64, u32, u16, u16) {
    let entry = q.desc + 16 * (index as u64 % q.size as u64);
    unsafe {
        let addr = u64::from_le(ptr::read_volatile(entry as usize as *const u64));
        let len = u32::from_le(ptr::read_volatile((entry + 8) as usize as *const u32));
        let flags = u16::from_le(ptr::read_volatile((entry + 12) as usize as *const u16));
        let next = u16::from_le(ptr::read_volatile((entry + 14) as usize as *const u16));
        (addr, len, flags, next)
    }
}

// post_used appends an entry to the queue's used ring and
// publishes it by advancing the used index.
//
fn post_used(q: &mut FakeQueue, id: u32, len: u32) {
    let slot = (q.used_count as u32 % q.size) as u64;
    let entry = q.device + 4 + 8 * slot;
    unsafe {
        ptr::write_volatile(entry as usize as *mut u32, id.to_le());
        ptr::write_volatile((entry + 4) as usize as *mut u32, len.to_le());
    }

    fence(Ordering::Release);

    q.used_count = q.used_count.wrapping_add(1);
    unsafe { ptr::write_volatile((q.device + 2) as usize as *mut u16, q.used_count.to_le()) };
}

// process_queue scans the queue's available ring for new
// chains, consuming device-readable chains immediately and
// matching device-writable chains against injected data.
//
fn process_queue(state: &mut State, queue: u16) {
    const NEXT: u16 = 1;
    const WRITE: u16 = 2;

    let mut q = match state.queues.remove(&queue) {
        Some(q) => q,
        None => return,
    };

    if q.ready && q.size > 0 {
        let size = q.size as u16;
        let avail = read_u16(q.driver + 2);
        while q.last_avail != avail {
            let slot = (q.last_avail % size) as u64;
            let head = read_u16(q.driver + 4 + 2 * slot);
            q.last_avail = q.last_avail.wrapping_add(1);

            let (_, _, flags, _) = read_descriptor(&q, head);
            if flags & WRITE != 0 {
                q.waiting.push_back(head);
                continue;
            }

            // Consume the readable chain now.
            let mut data = Vec::new();
            let mut index = head;
            for _ in 0..size {
                let (addr, len, flags, next) = read_descriptor(&q, index);
                if flags & WRITE == 0 {
                    let from = addr as usize as *const u8;
                    let start = data.len();
                    data.resize(start + len as usize, 0);
                    unsafe { ptr::copy(from, data[start..].as_mut_ptr(), len as usize) };
                }

                if flags & NEXT == 0 {
                    break;
                }

                index = next;
            }

            state.transfers.push((queue, data));
            let id = match state.corrupt_used.remove(&queue) {
                Some(id) => id,
                None => head as u32,
            };
            post_used(&mut q, id, 0);
            q.completed = q.completed.wrapping_add(1);
            state.interrupt_status |= InterruptStatus::RING_UPDATE.bits();
        }

        // Deliver injected data into any writable chains held.
        let mut pending = state.pending.remove(&queue).unwrap_or_default();
        while !pending.is_empty() && !q.waiting.is_empty() {
            let head = match q.waiting.pop_front() {
                Some(head) => head,
                None => break,
            };
            let data = match pending.pop_front() {
                Some(data) => data,
                None => break,
            };

            let mut written = 0usize;
            let mut index = head;
            let size = q.size as u16;
            for _ in 0..size {
                let (addr, len, flags, next) = read_descriptor(&q, index);
                if flags & WRITE != 0 && written < data.len() {
                    let take = core::cmp::min(len as usize, data.len() - written);
                    let to = addr as usize as *mut u8;
                    unsafe { ptr::copy(data[written..].as_ptr(), to, take) };
                    written += take;
                }

                if flags & NEXT == 0 {
                    break;
                }

                index = next;
            }

            post_used(&mut q, head as u32, written as u32);
            q.completed = q.completed.wrapping_add(1);
            state.interrupt_status |= InterruptStatus::RING_UPDATE.bits();
        }

        state.pending.insert(queue, pending);
    }

    state.queues.insert(queue, q);
}

impl Transport for FakeDevice {
    fn read_device_config_u8(&self, offset: u16) -> u8 {
        self.state.lock().config[offset as usize]
    }

    fn write_device_config_u8(&self, offset: u16, value: u8) {
        self.state.lock().config[offset as usize] = value;
    }

    fn read_interrupt_status(&self) -> InterruptStatus {
        InterruptStatus::from_bits_truncate(self.state.lock().interrupt_status)
    }

    fn ack_interrupt(&self, status: InterruptStatus) {
        self.state.lock().interrupt_status &= !status.bits();
    }

    fn read_status(&self) -> DeviceStatus {
        self.status()
    }

    fn write_status(&self, status: DeviceStatus) {
        let mut state = self.state.lock();
        let mut bits = status.bits();
        if state.drop_features_ok {
            bits &= !DeviceStatus::FEATURES_OK.bits();
        }

        if bits == 0 {
            // Device reset.
            state.queues.clear();
            state.pending.clear();
            state.corrupt_used.clear();
            state.interrupt_status = 0;
            state.driver_features = 0;
        }

        state.status = bits;
    }

    fn read_device_features(&self) -> u64 {
        self.state.lock().device_features
    }

    fn write_driver_features(&self, features: u64) {
        self.state.lock().driver_features = features;
    }

    fn select_queue(&self, index: u16) {
        self.state.lock().queue_sel = index;
    }

    fn queue_ready(&self) -> bool {
        let state = self.state.lock();
        match state.queues.get(&state.queue_sel) {
            Some(q) => q.ready,
            None => false,
        }
    }

    fn set_queue_ready(&self) {
        let mut state = self.state.lock();
        let sel = state.queue_sel;
        state
            .queues
            .entry(sel)
            .or_insert_with(FakeQueue::new)
            .ready = true;
    }

    fn max_queue_size(&self) -> u32 {
        self.state.lock().max_queue_size
    }

    fn set_queue_size(&self, size: u16) {
        let mut state = self.state.lock();
        let sel = state.queue_sel;
        state.queues.entry(sel).or_insert_with(FakeQueue::new).size = size as u32;
    }

    fn notify_queue(&self, queue: u16) {
        let mut state = self.state.lock();
        process_queue(&mut state, queue);
    }

    fn set_queue_descriptor_area(&self, area: PhysAddr) {
        let mut state = self.state.lock();
        let sel = state.queue_sel;
        state.queues.entry(sel).or_insert_with(FakeQueue::new).desc = area.as_u64();
    }

    fn set_queue_driver_area(&self, area: PhysAddr) {
        let mut state = self.state.lock();
        let sel = state.queue_sel;
        state
            .queues
            .entry(sel)
            .or_insert_with(FakeQueue::new)
            .driver = area.as_u64();
    }

    fn set_queue_device_area(&self, area: PhysAddr) {
        let mut state = self.state.lock();
        let sel = state.queue_sel;
        state
            .queues
            .entry(sel)
            .or_insert_with(FakeQueue::new)
            .device = area.as_u64();
    }
}

/// A counting semaphore for use in tests.
///
pub(crate) struct TestSemaphore {
    available: AtomicUsize,
}

impl TestSemaphore {
    /// Returns the number of permits currently available.
    ///
    pub fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }
}

impl Semaphore for TestSemaphore {
    fn take(&self, _timeout: Option<u64>) -> bool {
        // Tests are single-threaded, so nothing can release a
        // permit while we wait. Treat an empty semaphore as an
        // immediate timeout rather than spinning.
        loop {
            let n = self.available.load(Ordering::Acquire);
            if n == 0 {
                return false;
            }

            if self
                .available
                .compare_exchange(n, n - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn give(&self) {
        self.available.fetch_add(1, Ordering::Release);
    }
}

/// A fake OS for testing the drivers against.
///
pub(crate) struct TestOs {
    mac: Option<[u8; 6]>,
    irq_depth: AtomicUsize,
    semaphores: Mutex<Vec<Arc<TestSemaphore>>>,
}

impl TestOs {
    /// Returns a fake OS whose MAC address lookup returns
    /// `mac` for every interface.
    ///
    pub fn new(mac: Option<[u8; 6]>) -> TestOs {
        TestOs {
            mac,
            irq_depth: AtomicUsize::new(0),
            semaphores: Mutex::new(Vec::new()),
        }
    }

    /// Returns the most recently allocated semaphore.
    ///
    pub fn last_semaphore(&self) -> Arc<TestSemaphore> {
        let semaphores = self.semaphores.lock();
        match semaphores.last() {
            Some(semaphore) => semaphore.clone(),
            None => panic!("no semaphore has been allocated"),
        }
    }

    /// Returns the current interrupt lock depth, which must be
    /// zero once a driver call has returned.
    ///
    pub fn irq_depth(&self) -> usize {
        self.irq_depth.load(Ordering::Acquire)
    }
}

impl OsInterface for TestOs {
    fn sema_alloc(&self, _slots: usize, available: usize) -> Arc<dyn Semaphore> {
        let semaphore = Arc::new(TestSemaphore {
            available: AtomicUsize::new(available),
        });
        self.semaphores.lock().push(semaphore.clone());

        semaphore
    }

    fn irq_lock(&self) -> usize {
        self.irq_depth.fetch_add(1, Ordering::AcqRel)
    }

    fn irq_unlock(&self, _token: usize) {
        self.irq_depth.fetch_sub(1, Ordering::AcqRel);
    }

    fn mac_address(&self, _interface: &str) -> Option<[u8; 6]> {
        self.mac
    }
}
