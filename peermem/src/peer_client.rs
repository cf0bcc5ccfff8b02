/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # GPU Peer Client
//!
//! The peer-memory client the bridge registers: a [`GpuPeerClient`]
//! implementing the registry's seven-operation callback vtable over the GPU
//! interface adapter.
//!
//! The client creates no threads and never suspends; every operation runs
//! on the caller's thread and returns when its work is done. Per-region
//! sequencing is the registry's responsibility, but each operation still
//! checks the context state it depends on and refuses out-of-order calls
//! instead of repairing them.

use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::gpu_interface::GpuInterfaceAdapter;
use crate::invalidation::InvalidationRoute;
use crate::invalidation::revoke_notice_for;
use crate::mem_context::MemoryContext;
use crate::mem_context::RegionHandle;
use crate::primitives::ConsumerToken;
use crate::primitives::DmaDevice;
use crate::primitives::ProcessHandle;
use crate::primitives::SgTable;
use crate::registry::AcquireOutcome;
use crate::registry::PeerMemoryClient;

/// The type of error reported back through the callback vtable.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    /// The address given to a pin request does not match the one the region
    /// was acquired with.
    #[error("address mismatch: region acquired at {stored:#x}, pin requested {given:#x}")]
    AddressMismatch {
        /// Address captured at acquisition.
        stored: u64,
        /// Address the pin request carried.
        given: u64,
    },

    /// The size given to a pin request does not match the one the region
    /// was acquired with.
    #[error("size mismatch: region acquired with {stored:#x} bytes, pin requested {given:#x}")]
    SizeMismatch {
        /// Size captured at acquisition.
        stored: u64,
        /// Size the pin request carried.
        given: u64,
    },

    /// The operation needs pinned pages and the region has none.
    #[error("region {addr:#x} has no pinned pages")]
    NotPinned {
        /// Start address of the region.
        addr: u64,
    },

    /// A pin was requested while a previous pin is still outstanding.
    #[error("region {addr:#x} is already pinned")]
    AlreadyPinned {
        /// Start address of the region.
        addr: u64,
    },

    /// The GPU interface failed to pin the region's pages.
    #[error("pinning region {addr:#x} failed")]
    PinFailed {
        /// Start address of the region.
        addr: u64,
        /// Driver-side failure.
        #[source]
        source: anyhow::Error,
    },

    /// The GPU interface failed to unpin the region's pages. The pin is
    /// gone from the region's context either way.
    #[error("unpinning region {addr:#x} failed")]
    UnpinFailed {
        /// Start address of the region.
        addr: u64,
        /// Driver-side failure.
        #[source]
        source: anyhow::Error,
    },
}

/// A refused release. The handle comes back unmodified; unpin the region
/// and retry.
#[derive(thiserror::Error, Debug)]
#[error("region {:#x} still has pinned pages", .region.virtual_address())]
pub struct ReleaseError {
    /// The handle, returned to the caller.
    pub region: RegionHandle,
}

/// State shared between the client, its region contexts, and the revocation
/// notices recorded with the driver.
#[derive(Debug)]
pub(crate) struct ClientShared {
    /// Number of live region contexts. Gates bridge teardown.
    live_regions: AtomicU64,
    /// Installed invalidation route. Empty until registration completes and
    /// again after teardown.
    route: RwLock<Option<InvalidationRoute>>,
}

impl ClientShared {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            live_regions: AtomicU64::new(0),
            route: RwLock::new(None),
        })
    }

    pub(crate) fn region_created(&self) {
        self.live_regions.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn region_destroyed(&self) {
        self.live_regions.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn live_regions(&self) -> u64 {
        self.live_regions.load(Ordering::SeqCst)
    }

    pub(crate) fn route(&self) -> &RwLock<Option<InvalidationRoute>> {
        &self.route
    }
}

/// The peer-memory client the bridge registers.
#[derive(Debug)]
pub struct GpuPeerClient {
    gpu: GpuInterfaceAdapter,
    shared: Arc<ClientShared>,
}

impl GpuPeerClient {
    pub(crate) fn new(gpu: GpuInterfaceAdapter, shared: Arc<ClientShared>) -> Self {
        Self { gpu, shared }
    }
}

impl PeerMemoryClient for GpuPeerClient {
    fn acquire(&self, addr: u64, size: u64) -> AcquireOutcome {
        let owner = ProcessHandle::current();
        if !self.gpu.classify(addr, size, owner) {
            tracing::debug!("declining {:#x} ({} bytes): not GPU memory", addr, size);
            return AcquireOutcome::NotMine;
        }
        let context = MemoryContext::new(addr, size, owner, Arc::clone(&self.shared));
        tracing::debug!("acquired region {:#x} ({} bytes) for {}", addr, size, owner);
        AcquireOutcome::Mine(RegionHandle::new(context))
    }

    fn get_pages(
        &self,
        addr: u64,
        size: u64,
        region: &RegionHandle,
        consumer: ConsumerToken,
        write: bool,
        force: bool,
    ) -> Result<(), ClientError> {
        let context = region.context();
        if context.virtual_address() != addr {
            return Err(ClientError::AddressMismatch {
                stored: context.virtual_address(),
                given: addr,
            });
        }
        if context.size() != size {
            return Err(ClientError::SizeMismatch {
                stored: context.size(),
                given: size,
            });
        }
        tracing::debug!(
            "pinning region {:#x} ({} bytes, write: {}, force: {})",
            addr,
            size,
            write,
            force
        );
        // The slot guard stays held across the pin so a concurrent pin
        // attempt cannot interleave with this one.
        let mut page_table = context.page_table_slot();
        if page_table.is_some() {
            return Err(ClientError::AlreadyPinned { addr });
        }
        // The token goes in before pinning so a revocation firing while the
        // pin is still being set up already has something to forward.
        context.put_consumer(consumer);
        let notice = revoke_notice_for(context, &self.shared);
        match self.gpu.pin(addr, size, context.owner(), None, notice) {
            Ok(pages) => {
                *page_table = Some(pages);
                Ok(())
            }
            Err(err) => {
                context.take_consumer();
                Err(ClientError::PinFailed { addr, source: err })
            }
        }
    }

    fn dma_map(&self, region: &RegionHandle, device: &DmaDevice) -> Result<SgTable, ClientError> {
        let context = region.context();
        let page_table = context.page_table_slot();
        match page_table.as_ref() {
            Some(pages) => {
                let sg_table = pages.sg_table().clone();
                tracing::debug!(
                    "mapped region {:#x} for {}: {} sg entries",
                    context.virtual_address(),
                    device,
                    sg_table.page_count()
                );
                Ok(sg_table)
            }
            // Mapping is a view of the pinned table; without a pin there is
            // nothing to map.
            None => Err(ClientError::NotPinned {
                addr: context.virtual_address(),
            }),
        }
    }

    fn dma_unmap(&self, region: &RegionHandle, device: &DmaDevice) {
        // The mapping was a view of the pinned table; the pages themselves
        // go back at put_pages.
        tracing::debug!(
            "unmapped region {:#x} for {}",
            region.context().virtual_address(),
            device
        );
    }

    fn put_pages(&self, region: &RegionHandle) -> Result<(), ClientError> {
        let context = region.context();
        let addr = context.virtual_address();
        // Both slots are cleared up front: whatever the unpin below does, a
        // repeated put_pages must find nothing left to release.
        let pages = context.page_table_slot().take();
        let _ = context.take_consumer();
        let Some(pages) = pages else {
            tracing::debug!("put_pages on region {:#x} with nothing pinned", addr);
            return Ok(());
        };
        tracing::debug!("unpinning region {:#x}", addr);
        self.gpu.unpin(pages).map_err(|err| {
            tracing::error!("unpinning region {:#x} failed: {}", addr, err);
            ClientError::UnpinFailed { addr, source: err }
        })
    }

    fn get_page_size(&self, region: &RegionHandle) -> u64 {
        let context = region.context();
        let page_size = self
            .gpu
            .page_size_or_default(context.virtual_address(), context.size(), context.owner());
        tracing::debug!(
            "page size for region {:#x}: {}",
            context.virtual_address(),
            page_size
        );
        page_size
    }

    fn release(&self, region: RegionHandle) -> Result<(), ReleaseError> {
        let addr = region.virtual_address();
        if region.context().is_pinned() {
            // The registry owes a put_pages first; handing the region back
            // unmodified leaves the contract to its owner.
            tracing::error!("refusing to release region {:#x}: pages still pinned", addr);
            return Err(ReleaseError { region });
        }
        // Dropping the handle destroys the context and settles the liveness
        // count.
        drop(region);
        tracing::debug!("released region {:#x}", addr);
        Ok(())
    }
}
