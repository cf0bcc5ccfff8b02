/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! This file contains primitive data structures for the peer-memory protocol.
//!
//! Primitives:
//! - `BridgeConfig`: Bridge-wide configuration, holding the identity announced to the
//!   registry and the page size reported when the GPU interface cannot answer a query.
//! - `ClientIdentity`: The name/version pair a peer-memory client registers under.
//! - `ProcessHandle`: Identity of the process whose address space a memory region
//!   lives in.
//! - `ConsumerToken`: Opaque registry token attached to a pinned region and passed
//!   back verbatim on invalidation.
//! - `SgEntry` / `SgTable`: Scatter-gather description of a pinned region's physical
//!   backing, the unit of exchange for DMA mapping.
//! - `DmaDevice`: The DMA target device a mapping is requested for.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;

/// Page size reported when the GPU interface cannot answer a page-size
/// query. The page-size callback has no error path, so the answer has to
/// come from somewhere.
pub const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Client name announced to the peer-memory registry at registration.
pub const CLIENT_NAME: &str = "gpu_peer_bridge";

/// Client version announced alongside [`CLIENT_NAME`].
pub const CLIENT_VERSION: &str = "1.0";

/// Identity of the process whose address space a memory region lives in.
///
/// Captured once at acquisition; every later GPU interface call for the
/// region uses this handle, regardless of which context the registry drives
/// the callback from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle(u32);

impl ProcessHandle {
    /// The calling process.
    pub fn current() -> Self {
        Self(std::process::id())
    }

    /// Wraps a raw process id. Intended for registry shims and test doubles.
    pub fn from_raw(pid: u32) -> Self {
        Self(pid)
    }

    /// The raw process id.
    pub fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Opaque token the registry attaches to a pinned region.
///
/// Handed over at pin time and passed back verbatim if the region is
/// invalidated. The bridge never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerToken(u64);

impl ConsumerToken {
    /// Wraps a raw token value.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw token value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

/// A single scatter-gather element: one DMA-contiguous run of pinned pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgEntry {
    /// `dma_address` - Bus address the DMA engine should target.
    pub dma_address: u64,
    /// `length` - Length of the run in bytes.
    pub length: u64,
}

/// Scatter-gather description of a pinned region's physical backing.
///
/// Built by the GPU interface at pin time; handed to the registry at DMA map
/// time. The bridge only ever reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SgTable {
    entries: Vec<SgEntry>,
}

impl SgTable {
    /// Wraps a list of scatter-gather entries.
    pub fn new(entries: Vec<SgEntry>) -> Self {
        Self { entries }
    }

    /// Number of scatter-gather entries, i.e. the mapped page/run count.
    pub fn page_count(&self) -> usize {
        self.entries.len()
    }

    /// Total pinned bytes across all entries.
    pub fn total_len(&self) -> u64 {
        self.entries.iter().map(|entry| entry.length).sum()
    }

    /// Whether the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The scatter-gather entries in mapping order.
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }
}

/// The DMA target device a mapping is requested for.
///
/// Carried through for logging; any per-device decisions belong to the GPU
/// interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaDevice {
    /// `id` - Stable device identifier assigned by the registry.
    pub id: u64,
    /// `name` - Human-readable device name, when the registry knows one.
    pub name: Option<String>,
}

impl DmaDevice {
    /// An anonymous device known only by id.
    pub fn new(id: u64) -> Self {
        Self { id, name: None }
    }

    /// A device with a registry-supplied name.
    pub fn named(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: Some(name.into()),
        }
    }
}

impl fmt::Display for DmaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} (dma:{})", name, self.id),
            None => write!(f, "dma:{}", self.id),
        }
    }
}

/// The name/version pair a peer-memory client registers under.
///
/// The registry uses it for diagnostics and for telling clients apart; two
/// clients must not register under the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// `name` - Client name the registry reports in diagnostics.
    pub name: String,
    /// `version` - Client version string.
    pub version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            name: CLIENT_NAME.to_string(),
            version: CLIENT_VERSION.to_string(),
        }
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{}", self.name, self.version)
    }
}

/// Bridge-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// `identity` - Name/version announced to the registry at registration.
    pub identity: ClientIdentity,
    /// `fallback_page_size` - Page size reported when the GPU interface
    /// cannot answer a page-size query.
    pub fallback_page_size: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            identity: ClientIdentity::default(),
            fallback_page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl fmt::Display for BridgeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BridgeConfig {{ identity: {}, fallback_page_size: {} }}",
            self.identity, self.fallback_page_size,
        )
    }
}
