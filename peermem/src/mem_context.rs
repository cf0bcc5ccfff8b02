/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Memory Context
//!
//! Per-region state for the peer-memory protocol.
//!
//! One [`MemoryContext`] lives for each address range the bridge claims at
//! acquisition, from acquire to release. The registry holds it through an
//! opaque [`RegionHandle`] and threads that handle through every later
//! callback; there is no global table of contexts.
//!
//! Two resources tied to a context must be cleaned up exactly once even when
//! the normal path (`put_pages`) races the revocation path: the pinned page
//! table and the registry's consumer token. Each lives in a
//! `Mutex<Option<_>>` slot; whoever takes the slot performs the cleanup, and
//! everyone else observes it empty.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::gpu_interface::PageTableHandle;
use crate::peer_client::ClientShared;
use crate::primitives::ConsumerToken;
use crate::primitives::ProcessHandle;

/// Per-region bridge state, created at acquisition and destroyed at release.
pub struct MemoryContext {
    /// Start of the region in the owner's virtual address space. Immutable
    /// after acquisition.
    virtual_address: u64,
    /// Region length in bytes. Immutable after acquisition.
    size: u64,
    /// Process the region belongs to, captured at acquisition.
    owner: ProcessHandle,
    /// Pinned page table. `Some` only between a successful pin and the next
    /// unpin.
    page_table: Mutex<Option<PageTableHandle>>,
    /// Registry token for the current pin; forwarded verbatim on
    /// invalidation.
    consumer: Mutex<Option<ConsumerToken>>,
    /// Client-wide shared state, kept alive for the liveness count.
    shared: Arc<ClientShared>,
}

impl MemoryContext {
    /// Creates the context and counts the region as live.
    pub(crate) fn new(
        virtual_address: u64,
        size: u64,
        owner: ProcessHandle,
        shared: Arc<ClientShared>,
    ) -> Arc<Self> {
        shared.region_created();
        Arc::new(Self {
            virtual_address,
            size,
            owner,
            page_table: Mutex::new(None),
            consumer: Mutex::new(None),
            shared,
        })
    }

    /// Start of the region in its owner's virtual address space.
    pub fn virtual_address(&self) -> u64 {
        self.virtual_address
    }

    /// Region length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// The process the region belongs to.
    pub fn owner(&self) -> ProcessHandle {
        self.owner
    }

    /// Whether a pin is currently outstanding.
    pub fn is_pinned(&self) -> bool {
        self.page_table.lock().unwrap().is_some()
    }

    /// Locked access to the page-table slot. Holding the guard keeps the
    /// pin/unpin decision and its state change atomic.
    pub(crate) fn page_table_slot(&self) -> MutexGuard<'_, Option<PageTableHandle>> {
        self.page_table.lock().unwrap()
    }

    /// Stores the registry token for a pin being set up.
    pub(crate) fn put_consumer(&self, token: ConsumerToken) {
        *self.consumer.lock().unwrap() = Some(token);
    }

    /// Takes the registry token, leaving the slot empty. The taker is the
    /// one party allowed to act on it.
    pub(crate) fn take_consumer(&self) -> Option<ConsumerToken> {
        self.consumer.lock().unwrap().take()
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        if self.page_table.get_mut().unwrap().is_some() {
            // The pin can no longer be returned to the driver once the
            // context is gone; leak it loudly.
            tracing::error!(
                "region {:#x} destroyed with pages still pinned; pin leaked",
                self.virtual_address
            );
        }
        self.shared.region_destroyed();
    }
}

impl fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryContext")
            .field("virtual_address", &format_args!("{:#x}", self.virtual_address))
            .field("size", &self.size)
            .field("owner", &self.owner)
            .field("pinned", &self.is_pinned())
            .finish()
    }
}

/// Opaque per-region handle held by the registry between acquire and
/// release.
///
/// Deliberately not `Clone`: the registry is the one owner, and release
/// consumes the handle. The revocation path keeps only a weak reference to
/// the context underneath.
#[derive(Debug)]
pub struct RegionHandle {
    context: Arc<MemoryContext>,
}

impl RegionHandle {
    pub(crate) fn new(context: Arc<MemoryContext>) -> Self {
        Self { context }
    }

    pub(crate) fn context(&self) -> &Arc<MemoryContext> {
        &self.context
    }

    /// Start of the region in its owner's virtual address space.
    pub fn virtual_address(&self) -> u64 {
        self.context.virtual_address()
    }

    /// Region length in bytes.
    pub fn size(&self) -> u64 {
        self.context.size()
    }
}
