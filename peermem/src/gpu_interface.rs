/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # GPU Interface Adapter
//!
//! Typed boundary between the bridge and the GPU driver's memory-management
//! capability.
//!
//! The GPU driver exports four operations the bridge needs: an ownership
//! query, page pinning, page unpinning, and a page-size query. They are
//! modeled as the [`GpuMemoryInterface`] trait; the bridge talks to it only
//! through [`GpuInterfaceAdapter`], which adds the logging and the page-size
//! fallback the callback protocol requires and holds no per-region state.

use std::fmt;
use std::sync::Arc;

use crate::primitives::DmaDevice;
use crate::primitives::ProcessHandle;
use crate::primitives::SgTable;

/// Revocation callback handed to [`GpuMemoryInterface::pin_pages`].
///
/// The GPU driver fires it when it is about to move or free the pinned
/// pages. It may fire on any thread, at any point after pinning succeeds,
/// including after the region it refers to is gone.
pub type RevokeNotice = Box<dyn Fn() + Send + Sync>;

/// A pinned page table, as produced by [`GpuMemoryInterface::pin_pages`].
///
/// Owning one means the pin is outstanding. The handle is consumed by value
/// at unpin time, so a double unpin does not typecheck.
#[derive(Debug)]
pub struct PageTableHandle {
    driver_token: u64,
    sg_table: SgTable,
}

impl PageTableHandle {
    /// Wraps a driver-side pin token and the scatter-gather view of the
    /// pinned pages.
    pub fn new(driver_token: u64, sg_table: SgTable) -> Self {
        Self {
            driver_token,
            sg_table,
        }
    }

    /// Driver-side token identifying this pin.
    pub fn driver_token(&self) -> u64 {
        self.driver_token
    }

    /// Scatter-gather view of the pinned pages.
    pub fn sg_table(&self) -> &SgTable {
        &self.sg_table
    }
}

/// The GPU driver's memory-management capability.
///
/// Implementations live on the driver side of the bridge. All methods must
/// be callable from any thread.
pub trait GpuMemoryInterface: Send + Sync {
    /// Whether `[addr, addr + size)` lies in GPU-managed memory belonging to
    /// `process`. The registry probes every address it cannot place, so
    /// implementations must keep this cheap.
    fn is_gpu_address(&self, addr: u64, size: u64, process: ProcessHandle) -> bool;

    /// Pins the pages backing `[addr, addr + size)` and builds their
    /// scatter-gather table. The driver retains `on_revoke` and fires it if
    /// the pinned pages are about to be moved or freed.
    ///
    /// `dma_device` is the eventual DMA target when the caller already knows
    /// it; pinning itself is device-independent.
    fn pin_pages(
        &self,
        addr: u64,
        size: u64,
        process: ProcessHandle,
        dma_device: Option<&DmaDevice>,
        on_revoke: RevokeNotice,
    ) -> Result<PageTableHandle, anyhow::Error>;

    /// Unpins a previously pinned page table, consuming the handle.
    fn unpin_pages(&self, pages: PageTableHandle) -> Result<(), anyhow::Error>;

    /// The page size backing `[addr, addr + size)`.
    fn page_size(
        &self,
        addr: u64,
        size: u64,
        process: ProcessHandle,
    ) -> Result<u64, anyhow::Error>;
}

/// Thin typed wrapper around a [`GpuMemoryInterface`] capability.
#[derive(Clone)]
pub struct GpuInterfaceAdapter {
    gpu: Arc<dyn GpuMemoryInterface>,
    fallback_page_size: u64,
}

impl GpuInterfaceAdapter {
    /// Wraps `gpu`, masking failed page-size queries with
    /// `fallback_page_size`.
    pub fn new(gpu: Arc<dyn GpuMemoryInterface>, fallback_page_size: u64) -> Self {
        Self {
            gpu,
            fallback_page_size,
        }
    }

    /// Whether the range is GPU-managed memory owned by `process`.
    pub fn classify(&self, addr: u64, size: u64, process: ProcessHandle) -> bool {
        self.gpu.is_gpu_address(addr, size, process)
    }

    /// Pins the range, forwarding failures unchanged.
    pub fn pin(
        &self,
        addr: u64,
        size: u64,
        process: ProcessHandle,
        dma_device: Option<&DmaDevice>,
        on_revoke: RevokeNotice,
    ) -> Result<PageTableHandle, anyhow::Error> {
        let pages = self
            .gpu
            .pin_pages(addr, size, process, dma_device, on_revoke)?;
        tracing::debug!(
            "pinned region {:#x} ({} bytes) for {}: {} sg entries",
            addr,
            size,
            process,
            pages.sg_table().page_count()
        );
        Ok(pages)
    }

    /// Unpins, forwarding failures unchanged. The handle is consumed either
    /// way; there is no retry.
    pub fn unpin(&self, pages: PageTableHandle) -> Result<(), anyhow::Error> {
        self.gpu.unpin_pages(pages)
    }

    /// The region's page size, or the configured fallback when the query
    /// fails. The page-size callback has no error path, so the failure is
    /// masked here and logged.
    pub fn page_size_or_default(&self, addr: u64, size: u64, process: ProcessHandle) -> u64 {
        match self.gpu.page_size(addr, size, process) {
            Ok(page_size) => page_size,
            Err(err) => {
                tracing::warn!(
                    "page size query for {:#x} failed, reporting {}: {}",
                    addr,
                    self.fallback_page_size,
                    err
                );
                self.fallback_page_size
            }
        }
    }
}

impl fmt::Debug for GpuInterfaceAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuInterfaceAdapter")
            .field("fallback_page_size", &self.fallback_page_size)
            .finish()
    }
}
