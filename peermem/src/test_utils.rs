/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Test doubles for the peer-memory protocol: a scriptable GPU driver, a
//! recording registry, and an environment builder that wires the two to a
//! registered bridge.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::bridge::PeerMemoryBridge;
use crate::gpu_interface::GpuMemoryInterface;
use crate::gpu_interface::PageTableHandle;
use crate::gpu_interface::RevokeNotice;
use crate::mem_context::RegionHandle;
use crate::primitives::BridgeConfig;
use crate::primitives::ClientIdentity;
use crate::primitives::ConsumerToken;
use crate::primitives::DmaDevice;
use crate::primitives::ProcessHandle;
use crate::primitives::SgEntry;
use crate::primitives::SgTable;
use crate::registry::AcquireOutcome;
use crate::registry::InvalidateCallback;
use crate::registry::PeerMemoryClient;
use crate::registry::PeerMemoryRegistry;
use crate::registry::Registration;
use crate::registry::RegistrationHandle;

/// One pin request observed by [`FakeGpu`].
#[derive(Debug, Clone)]
pub struct PinRecord {
    pub addr: u64,
    pub size: u64,
    pub process: ProcessHandle,
    pub driver_token: u64,
}

/// Scriptable stand-in for a GPU driver's memory interface.
///
/// Claims a single configurable address window as GPU memory, records every
/// call it receives, keeps the revocation notices it is handed so tests can
/// fire them, and can be told to fail pinning, unpinning, or page-size
/// queries.
pub struct FakeGpu {
    window_start: u64,
    window_len: u64,
    fail_pin: AtomicBool,
    fail_unpin: AtomicBool,
    fail_page_size: AtomicBool,
    next_driver_token: AtomicU64,
    pin_attempts: AtomicU64,
    /// Successful pins, in order.
    pub pins: Mutex<Vec<PinRecord>>,
    pub unpins: Mutex<Vec<u64>>,
    pub page_size_queries: Mutex<Vec<(u64, u64, ProcessHandle)>>,
    revokers: Mutex<Vec<(u64, RevokeNotice)>>,
}

impl FakeGpu {
    /// Page size reported for every successful query.
    pub const PAGE_SIZE: u64 = 65536;

    /// A fake driver claiming `[window_start, window_start + window_len)`.
    pub fn claiming(window_start: u64, window_len: u64) -> Arc<Self> {
        Arc::new(Self {
            window_start,
            window_len,
            fail_pin: AtomicBool::new(false),
            fail_unpin: AtomicBool::new(false),
            fail_page_size: AtomicBool::new(false),
            next_driver_token: AtomicU64::new(rand::random::<u16>() as u64),
            pin_attempts: AtomicU64::new(0),
            pins: Mutex::new(Vec::new()),
            unpins: Mutex::new(Vec::new()),
            page_size_queries: Mutex::new(Vec::new()),
            revokers: Mutex::new(Vec::new()),
        })
    }

    pub fn set_fail_pin(&self, fail: bool) {
        self.fail_pin.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unpin(&self, fail: bool) {
        self.fail_unpin.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_page_size(&self, fail: bool) {
        self.fail_page_size.store(fail, Ordering::SeqCst);
    }

    pub fn pin_count(&self) -> usize {
        self.pins.lock().unwrap().len()
    }

    /// Pin requests received, successful or not.
    pub fn pin_attempts(&self) -> u64 {
        self.pin_attempts.load(Ordering::SeqCst)
    }

    pub fn unpin_count(&self) -> usize {
        self.unpins.lock().unwrap().len()
    }

    /// Driver token of the most recent pin.
    pub fn last_driver_token(&self) -> u64 {
        self.pins.lock().unwrap().last().unwrap().driver_token
    }

    /// Takes the revocation notice recorded for `driver_token` without
    /// firing it, so a test can fire it later (or from another thread),
    /// even after the pin is long gone.
    pub fn take_revoker(&self, driver_token: u64) -> Option<RevokeNotice> {
        let mut revokers = self.revokers.lock().unwrap();
        let index = revokers
            .iter()
            .position(|(token, _)| *token == driver_token)?;
        Some(revokers.remove(index).1)
    }

    /// Fires and consumes every recorded revocation notice.
    pub fn revoke_all(&self) {
        let revokers = std::mem::take(&mut *self.revokers.lock().unwrap());
        for (_, notice) in revokers {
            notice();
        }
    }
}

impl GpuMemoryInterface for FakeGpu {
    fn is_gpu_address(&self, addr: u64, size: u64, _process: ProcessHandle) -> bool {
        addr >= self.window_start && addr + size <= self.window_start + self.window_len
    }

    fn pin_pages(
        &self,
        addr: u64,
        size: u64,
        process: ProcessHandle,
        _dma_device: Option<&DmaDevice>,
        on_revoke: RevokeNotice,
    ) -> Result<PageTableHandle, anyhow::Error> {
        self.pin_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_pin.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected pin failure at {:#x}", addr));
        }
        let driver_token = self.next_driver_token.fetch_add(1, Ordering::SeqCst);
        // Page-granular entries with synthetic bus addresses.
        let mut entries = Vec::new();
        let mut offset = 0;
        while offset < size {
            let length = Self::PAGE_SIZE.min(size - offset);
            entries.push(SgEntry {
                dma_address: 0xd000_0000 + addr + offset,
                length,
            });
            offset += length;
        }
        self.pins.lock().unwrap().push(PinRecord {
            addr,
            size,
            process,
            driver_token,
        });
        self.revokers.lock().unwrap().push((driver_token, on_revoke));
        Ok(PageTableHandle::new(driver_token, SgTable::new(entries)))
    }

    fn unpin_pages(&self, pages: PageTableHandle) -> Result<(), anyhow::Error> {
        self.unpins.lock().unwrap().push(pages.driver_token());
        // The driver forgets the notice once the pin is returned.
        self.revokers
            .lock()
            .unwrap()
            .retain(|(token, _)| *token != pages.driver_token());
        if self.fail_unpin.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected unpin failure"));
        }
        Ok(())
    }

    fn page_size(
        &self,
        addr: u64,
        size: u64,
        process: ProcessHandle,
    ) -> Result<u64, anyhow::Error> {
        self.page_size_queries
            .lock()
            .unwrap()
            .push((addr, size, process));
        if self.fail_page_size.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected page size query failure"));
        }
        Ok(Self::PAGE_SIZE)
    }
}

/// One registration observed by [`RecordingRegistry`].
#[derive(Clone)]
pub struct RegisteredClient {
    pub handle: RegistrationHandle,
    pub identity: ClientIdentity,
    pub client: Arc<dyn PeerMemoryClient>,
}

/// Recording stand-in for the host peer-memory registry.
///
/// Mints registration handles, keeps the clients it is handed, and logs
/// every invalidation report delivered through the callback it returns.
pub struct RecordingRegistry {
    fail_register: AtomicBool,
    next_handle: AtomicU64,
    pub registered: Mutex<Vec<RegisteredClient>>,
    pub unregistered: Mutex<Vec<RegistrationHandle>>,
    pub invalidations: Arc<Mutex<Vec<(RegistrationHandle, ConsumerToken)>>>,
}

impl RecordingRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_register: AtomicBool::new(false),
            next_handle: AtomicU64::new(rand::random::<u16>() as u64 + 1),
            registered: Mutex::new(Vec::new()),
            unregistered: Mutex::new(Vec::new()),
            invalidations: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    /// Handle minted for the most recent registration.
    pub fn last_handle(&self) -> RegistrationHandle {
        self.registered.lock().unwrap().last().unwrap().handle
    }

    /// Invalidation reports received so far.
    pub fn invalidation_log(&self) -> Vec<(RegistrationHandle, ConsumerToken)> {
        self.invalidations.lock().unwrap().clone()
    }
}

impl PeerMemoryRegistry for RecordingRegistry {
    fn register(
        &self,
        identity: ClientIdentity,
        client: Arc<dyn PeerMemoryClient>,
    ) -> Result<Registration, anyhow::Error> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("injected registration failure for {}", identity));
        }
        let handle = RegistrationHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.registered.lock().unwrap().push(RegisteredClient {
            handle,
            identity,
            client,
        });
        let sink = Arc::clone(&self.invalidations);
        let invalidate: InvalidateCallback = Arc::new(move |handle, token| {
            sink.lock().unwrap().push((handle, token));
        });
        Ok(Registration { handle, invalidate })
    }

    fn unregister(&self, handle: RegistrationHandle) -> Result<(), anyhow::Error> {
        self.unregistered.lock().unwrap().push(handle);
        Ok(())
    }
}

/// A registered bridge wired to a [`FakeGpu`] and a [`RecordingRegistry`].
pub struct BridgeTestEnv {
    pub gpu: Arc<FakeGpu>,
    pub registry: Arc<RecordingRegistry>,
    pub bridge: PeerMemoryBridge,
}

impl BridgeTestEnv {
    /// Registers a bridge over a fake driver claiming `[window_start,
    /// window_start + window_len)`.
    pub fn setup(window_start: u64, window_len: u64) -> Result<Self, anyhow::Error> {
        let gpu = FakeGpu::claiming(window_start, window_len);
        let registry = RecordingRegistry::new();
        let bridge = PeerMemoryBridge::register(
            gpu.clone(),
            registry.clone(),
            BridgeConfig::default(),
        )?;
        Ok(Self {
            gpu,
            registry,
            bridge,
        })
    }

    /// The registered client, as the registry sees it.
    pub fn client(&self) -> Arc<dyn PeerMemoryClient> {
        Arc::clone(&self.registry.registered.lock().unwrap()[0].client)
    }
}

/// Unwraps the region handle out of a claimed acquire outcome.
pub fn expect_mine(outcome: AcquireOutcome) -> RegionHandle {
    match outcome {
        AcquireOutcome::Mine(region) => region,
        AcquireOutcome::NotMine => panic!("expected the address range to be claimed"),
    }
}
