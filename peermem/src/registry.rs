/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Registry Protocol
//!
//! The contract between a peer-memory client and the host RDMA subsystem's
//! registry.
//!
//! The registry owns memory registration for the RDMA stack. When it meets a
//! virtual address it cannot place as ordinary host memory, it offers the
//! address to each registered [`PeerMemoryClient`] in turn; the client that
//! claims it then drives the region's whole lifecycle through the callback
//! vtable defined here.
//!
//! For one region the registry calls, in order: `acquire`, `get_pages`,
//! `dma_map`, then eventually `dma_unmap`, `put_pages`, `release`. Pinning
//! and mapping may repeat in between. Invalidation is the one out-of-band
//! event: it flows the other way, from the client to the registry, through
//! the [`InvalidateCallback`] returned at registration.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::mem_context::RegionHandle;
use crate::peer_client::ClientError;
use crate::peer_client::ReleaseError;
use crate::primitives::ClientIdentity;
use crate::primitives::ConsumerToken;
use crate::primitives::DmaDevice;
use crate::primitives::SgTable;

/// Routing decision for a candidate address offered by the registry.
#[derive(Debug)]
pub enum AcquireOutcome {
    /// The address is not GPU-managed memory; the registry should fall back
    /// to its ordinary host-memory path. A claim the client cannot set up a
    /// context for reports the same way, so the registry always has that
    /// fallback.
    NotMine,
    /// The address is GPU-managed. The handle owns the region's context and
    /// must be threaded through every later callback for the region.
    Mine(RegionHandle),
}

impl AcquireOutcome {
    /// Whether the client claimed the address.
    pub fn is_mine(&self) -> bool {
        matches!(self, AcquireOutcome::Mine(_))
    }
}

/// The callback vtable a peer-memory client presents to the registry.
///
/// The registry drives one region through at most one vtable call at a
/// time; invalidation is the only event that may arrive concurrently with
/// them. Implementations must not block on registry state from inside a
/// callback.
pub trait PeerMemoryClient: Send + Sync {
    /// Claims or declines a candidate address range.
    fn acquire(&self, addr: u64, size: u64) -> AcquireOutcome;

    /// Pins the region's pages.
    ///
    /// `consumer` is the registry's token for this pin, passed back verbatim
    /// if the region is invalidated. `write` and `force` describe the
    /// registry's intended access; they do not affect pinning.
    ///
    /// `addr` and `size` must match the values the region was acquired
    /// with. On any error nothing is pinned and the region is unchanged.
    fn get_pages(
        &self,
        addr: u64,
        size: u64,
        region: &RegionHandle,
        consumer: ConsumerToken,
        write: bool,
        force: bool,
    ) -> Result<(), ClientError>;

    /// Produces the scatter-gather table of a pinned region, mapped for
    /// `device`. Fails if the region has no pinned pages.
    fn dma_map(&self, region: &RegionHandle, device: &DmaDevice) -> Result<SgTable, ClientError>;

    /// Retires the mapping handed out for `device`. The pin itself stays.
    fn dma_unmap(&self, region: &RegionHandle, device: &DmaDevice);

    /// Unpins the region's pages. A benign no-op if nothing is pinned.
    fn put_pages(&self, region: &RegionHandle) -> Result<(), ClientError>;

    /// The page size backing the region. Infallible; a failed query
    /// degrades to the client's configured fallback.
    fn get_page_size(&self, region: &RegionHandle) -> u64;

    /// Destroys the region's context, consuming the handle. Refused, with
    /// the handle returned, while pages are still pinned.
    fn release(&self, region: RegionHandle) -> Result<(), ReleaseError>;
}

/// Registry-minted identifier for one registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegistrationHandle(u64);

impl RegistrationHandle {
    /// Wraps a raw handle value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw handle value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg:{:#x}", self.0)
    }
}

/// Registry entry point for invalidation reports: the client passes its own
/// registration handle and the consumer token of the affected pin.
pub type InvalidateCallback = Arc<dyn Fn(RegistrationHandle, ConsumerToken) + Send + Sync>;

/// A successful registration.
#[derive(Clone)]
pub struct Registration {
    /// `handle` - Registry-minted identifier for this client.
    pub handle: RegistrationHandle,
    /// `invalidate` - Registry entry point for invalidation reports.
    pub invalidate: InvalidateCallback,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("handle", &self.handle)
            .finish()
    }
}

/// The host RDMA subsystem's peer-memory registry.
pub trait PeerMemoryRegistry: Send + Sync {
    /// Registers a client under `identity`. Once this returns, the registry
    /// may start offering unrecognized addresses to `client` and expects
    /// invalidation reports through the returned callback.
    fn register(
        &self,
        identity: ClientIdentity,
        client: Arc<dyn PeerMemoryClient>,
    ) -> Result<Registration, anyhow::Error>;

    /// Removes a previously registered client. The registry delivers no
    /// callbacks for it after this returns.
    fn unregister(&self, handle: RegistrationHandle) -> Result<(), anyhow::Error>;
}
