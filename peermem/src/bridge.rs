/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Peer Memory Bridge
//!
//! Registration and teardown of the peer-memory client.
//!
//! [`PeerMemoryBridge::register`] wires a GPU interface and a registry
//! together: it builds the client, registers it, and installs the returned
//! invalidation route. The bridge then guards the registration for its
//! lifetime; a process runs at most one bridge per GPU driver.
//!
//! Teardown is gated on region liveness. As long as any acquired region is
//! alive, its context can be reached by registry callbacks and revocation
//! notices, so [`shutdown`](PeerMemoryBridge::shutdown) refuses and hands
//! the bridge back. Dropping the bridge tears down unconditionally, loudly
//! when regions are still outstanding.

use std::fmt;
use std::sync::Arc;

use crate::gpu_interface::GpuInterfaceAdapter;
use crate::gpu_interface::GpuMemoryInterface;
use crate::invalidation::InvalidationRoute;
use crate::peer_client::ClientShared;
use crate::peer_client::GpuPeerClient;
use crate::primitives::BridgeConfig;
use crate::registry::PeerMemoryRegistry;
use crate::registry::RegistrationHandle;

/// A refused shutdown. The bridge comes back unmodified; retry once the
/// registry has released its regions.
#[derive(thiserror::Error, Debug)]
#[error("{outstanding} region(s) still outstanding")]
pub struct ShutdownBlocked {
    /// Live region count observed at the refusal.
    pub outstanding: u64,
    /// The bridge, returned to the caller.
    pub bridge: PeerMemoryBridge,
}

/// Live bridge between a GPU driver and a peer-memory registry.
pub struct PeerMemoryBridge {
    registry: Arc<dyn PeerMemoryRegistry>,
    shared: Arc<ClientShared>,
    registration: Option<RegistrationHandle>,
}

impl PeerMemoryBridge {
    /// Builds the peer-memory client for `gpu` and registers it with
    /// `registry`.
    ///
    /// On success the returned bridge owns the registration and revocation
    /// notices start flowing to the registry. A registration failure leaves
    /// nothing behind: no client, no route, no callbacks.
    ///
    /// # Arguments
    ///
    /// * `gpu` - The GPU driver's memory-management capability.
    /// * `registry` - The host RDMA subsystem's peer-memory registry.
    /// * `config` - Identity to register under and page-size fallback.
    pub fn register(
        gpu: Arc<dyn GpuMemoryInterface>,
        registry: Arc<dyn PeerMemoryRegistry>,
        config: BridgeConfig,
    ) -> Result<Self, anyhow::Error> {
        tracing::info!("registering peer memory client with {}", config);
        let shared = ClientShared::new();
        let adapter = GpuInterfaceAdapter::new(gpu, config.fallback_page_size);
        let client = Arc::new(GpuPeerClient::new(adapter, Arc::clone(&shared)));
        let registration = registry.register(config.identity.clone(), client)?;
        let handle = registration.handle;
        // The route goes in only after registration has succeeded, so a
        // failed registration installs nothing.
        *shared.route().write().unwrap() = Some(InvalidationRoute {
            handle,
            callback: registration.invalidate,
        });
        tracing::info!("registered peer memory client {} as {}", config.identity, handle);
        Ok(Self {
            registry,
            shared,
            registration: Some(handle),
        })
    }

    /// Number of regions currently alive: acquired and not yet released.
    pub fn outstanding_regions(&self) -> u64 {
        self.shared.live_regions()
    }

    /// Unregisters from the registry.
    ///
    /// Refused while any region is outstanding, with the bridge handed back
    /// inside the error; the registry must release its regions first.
    pub fn shutdown(mut self) -> Result<(), ShutdownBlocked> {
        let outstanding = self.outstanding_regions();
        if outstanding > 0 {
            return Err(ShutdownBlocked {
                outstanding,
                bridge: self,
            });
        }
        self.teardown();
        Ok(())
    }

    /// Clears the invalidation route, then unregisters. Clearing first
    /// means the write lock waits out any invalidation still being
    /// forwarded, and nothing new is forwarded afterwards.
    fn teardown(&mut self) {
        let Some(handle) = self.registration.take() else {
            return;
        };
        self.shared.route().write().unwrap().take();
        match self.registry.unregister(handle) {
            Ok(()) => tracing::info!("unregistered peer memory client {}", handle),
            Err(err) => {
                tracing::error!("unregistering peer memory client {} failed: {}", handle, err)
            }
        }
    }
}

impl Drop for PeerMemoryBridge {
    fn drop(&mut self) {
        let outstanding = self.outstanding_regions();
        if outstanding > 0 {
            tracing::error!(
                "peer memory bridge dropped with {} region(s) outstanding",
                outstanding
            );
        }
        self.teardown();
    }
}

impl fmt::Debug for PeerMemoryBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerMemoryBridge")
            .field("registration", &self.registration)
            .field("outstanding_regions", &self.outstanding_regions())
            .finish()
    }
}
