/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # GPU Peer-Memory Bridge
//!
//! Lets an RDMA NIC perform zero-copy DMA against GPU-driver-owned memory.
//!
//! The bridge registers a peer-memory client with the host RDMA subsystem's
//! registry. Virtual addresses the registry cannot place as ordinary host
//! memory are offered to the client, which claims the GPU-managed ones and
//! then drives pinning, DMA mapping, and release for them on the registry's
//! behalf.
//!
//! ## Core pieces
//!
//! * `PeerMemoryBridge` - registration and teardown; one per GPU driver.
//! * `GpuPeerClient` - the callback vtable the registry drives.
//! * `MemoryContext` / `RegionHandle` - per-region lifecycle state.
//! * `GpuMemoryInterface` / `PeerMemoryRegistry` - the two external
//!   collaborators, as traits.
//!
//! ## Region lifecycle
//!
//! 1. `acquire` claims an address range the registry cannot place
//! 2. `get_pages` pins the range's backing pages
//! 3. `dma_map` hands out the scatter-gather table for a DMA device
//! 4. `dma_unmap` and `put_pages` undo the above
//! 5. `release` destroys the region's context
//!
//! The GPU driver may revoke a pin at any point in between; the revocation
//! is forwarded to the registry, which reacts by driving the normal
//! teardown path.

mod bridge;
mod gpu_interface;
mod invalidation;
mod mem_context;
mod peer_client;
mod primitives;
mod registry;

pub use bridge::*;
pub use gpu_interface::*;
pub use mem_context::*;
pub use peer_client::*;
pub use primitives::*;
pub use registry::*;

#[cfg(test)]
mod test_utils;
