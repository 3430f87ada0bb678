// Copyright 2022 The Firefly Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Contains the transports over which a Virtio device can be
//! attached.
//!
//! Each transport implements the [`Transport`](crate::Transport)
//! trait, which gives the rest of the crate a uniform view of the
//! device's status, features, queues and configuration area.

pub mod mmio;
