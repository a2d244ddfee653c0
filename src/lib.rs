// Copyright (c) 2019 Cloudflare, Inc. All rights reserved.
// SPDX-License-Identifier: BSD-3-Clause

//! A userspace implementation of a Noise-IK secure tunnel protocol.
//!
//! [`noise`] implements the handshake, session and timer state machine for
//! a single peer. [`device`] (behind the `device` feature) wires a
//! collection of peers into a multi-threaded packet pipeline sitting on a
//! virtual interface and a UDP socket pair.

pub mod noise;
pub mod serialization;

#[cfg(feature = "device")]
pub mod config;
#[cfg(feature = "device")]
pub mod device;

#[cfg(unix)]
pub(crate) mod sleepyinstant;

/// Re-export of the x25519 types
pub mod x25519 {
    pub use x25519_dalek::{
        EphemeralSecret, PublicKey, ReusableSecret, SharedSecret, StaticSecret,
    };
}
