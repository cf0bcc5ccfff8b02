/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! # Invalidation Path
//!
//! Forwards revocation notices from the GPU driver to the registry.
//!
//! When the driver is about to move or free pinned pages, it fires the
//! revocation notice recorded at pin time. The notice arrives on whatever
//! thread the driver chooses, possibly long after the region, the
//! registration, or the whole client is gone, and it must never fault that
//! thread. Every step of the forward is therefore defensive: a dead
//! reference or an empty slot downgrades the notice to a log line.
//!
//! Forwarding does not unpin and does not destroy the context. The registry
//! reacts to the report by driving the normal teardown path (`put_pages`,
//! `release`) through the callback vtable.

use std::sync::Arc;
use std::sync::Weak;

use crate::gpu_interface::RevokeNotice;
use crate::mem_context::MemoryContext;
use crate::peer_client::ClientShared;
use crate::registry::InvalidateCallback;
use crate::registry::RegistrationHandle;

/// Where invalidation reports go: the registration this client runs under
/// and the registry's callback.
#[derive(Clone)]
pub(crate) struct InvalidationRoute {
    pub(crate) handle: RegistrationHandle,
    pub(crate) callback: InvalidateCallback,
}

impl std::fmt::Debug for InvalidationRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvalidationRoute")
            .field("handle", &self.handle)
            .finish()
    }
}

/// Builds the revocation notice to record with a pin of `context`'s pages.
///
/// The notice captures only weak references: it must not keep the region
/// alive past its release, and it must survive the client itself going
/// away.
pub(crate) fn revoke_notice_for(
    context: &Arc<MemoryContext>,
    shared: &Arc<ClientShared>,
) -> RevokeNotice {
    let context = Arc::downgrade(context);
    let shared = Arc::downgrade(shared);
    Box::new(move || forward_invalidation(&context, &shared))
}

/// Forwards one revocation notice to the registry.
fn forward_invalidation(context: &Weak<MemoryContext>, shared: &Weak<ClientShared>) {
    let Some(context) = context.upgrade() else {
        tracing::warn!("dropping invalidation for an already-destroyed region");
        return;
    };
    // Taking the token makes each pin's invalidation deliverable at most
    // once; put_pages clears the same slot on the normal path.
    let Some(token) = context.take_consumer() else {
        tracing::debug!(
            "invalidation for region {:#x} arrived after its pin was returned",
            context.virtual_address()
        );
        return;
    };
    let Some(shared) = shared.upgrade() else {
        tracing::warn!(
            "dropping invalidation for region {:#x}: client is gone",
            context.virtual_address()
        );
        return;
    };
    // The read guard stays held across the callback so teardown's write
    // lock waits for in-flight forwards to finish.
    let route = shared.route().read().unwrap();
    match route.as_ref() {
        Some(route) => {
            tracing::debug!(
                "invalidating region {:#x} under {}",
                context.virtual_address(),
                route.handle
            );
            (route.callback)(route.handle, token);
        }
        None => {
            tracing::warn!(
                "dropping invalidation for region {:#x}: no registration installed",
                context.virtual_address()
            );
        }
    }
}
