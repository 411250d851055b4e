//! SAM resource pool
//!
//! Exclusivity of a SAM is the provider's job; [`SamResourcePool`] adds the
//! blocking, timeout and cancellation policy on top of it. Blocked callers wake
//! when a resource is released through the pool and re-poll the provider every
//! [`PoolConfig::poll_interval`] to catch resources freed elsewhere.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::PoolError;

/// SAM generation accepted by an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SamRevision {
    /// Any revision
    #[default]
    Auto,
    C1,
    S1E,
    S1D,
}

/// What a concrete SAM declares about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamDescriptor {
    pub group_reference: String,
    pub revision: SamRevision,
    pub serial_number: Vec<u8>,
}

/// Filter selecting which SAMs may be handed out
#[derive(Debug, Clone)]
pub struct SamIdentifier {
    group_reference: String,
    revision: SamRevision,
    serial_pattern: Option<Regex>,
}

impl SamIdentifier {
    pub fn new(group_reference: impl Into<String>) -> Self {
        Self {
            group_reference: group_reference.into(),
            revision: SamRevision::Auto,
            serial_pattern: None,
        }
    }

    pub fn with_revision(mut self, revision: SamRevision) -> Self {
        self.revision = revision;
        self
    }

    /// Restrict to serial numbers whose upper-case hex matches `pattern`
    pub fn with_serial_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.serial_pattern = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn group_reference(&self) -> &str {
        &self.group_reference
    }

    pub fn matches(&self, sam: &SamDescriptor) -> bool {
        if sam.group_reference != self.group_reference {
            return false;
        }
        if self.revision != SamRevision::Auto && self.revision != sam.revision {
            return false;
        }
        match &self.serial_pattern {
            Some(pattern) => pattern.is_match(&hex::encode_upper(&sam.serial_number)),
            None => true,
        }
    }
}

/// A SAM handed out by a provider
///
/// Resources built with [`SamResource::new`] carry no lease, so neither
/// [`StaticSamProvider`] nor [`SamResourcePool`] accepts them back.
#[derive(Debug)]
pub struct SamResource<H> {
    name: String,
    descriptor: SamDescriptor,
    handle: H,
    /// Slot generation stamped by [`StaticSamProvider`]
    slot_lease: u64,
    /// Allocation id stamped by [`SamResourcePool`]
    pool_lease: u64,
}

impl<H> SamResource<H> {
    pub fn new(name: impl Into<String>, descriptor: SamDescriptor, handle: H) -> Self {
        Self {
            name: name.into(),
            descriptor,
            handle,
            slot_lease: 0,
            pool_lease: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn descriptor(&self) -> &SamDescriptor {
        &self.descriptor
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    /// The reader channel, e.g. to build a [`crate::sam::CalypsoSam`] on it
    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }
}

/// Source of SAM resources; must never hand the same SAM to two callers
pub trait SamProvider: Send + Sync {
    type Handle: Send;

    /// Take a free matching SAM without waiting
    fn try_allocate(&self, identifier: &SamIdentifier) -> Option<SamResource<Self::Handle>>;

    /// Give a SAM back
    fn release(&self, resource: SamResource<Self::Handle>) -> Result<(), PoolError>;
}

struct Slot<H> {
    name: String,
    descriptor: SamDescriptor,
    handle: Option<H>,
    /// Lease of the current holder, zero while free
    lease: u64,
}

struct Slots<H> {
    slots: Vec<Slot<H>>,
    next_lease: u64,
}

/// Provider over a fixed set of SAM slots
pub struct StaticSamProvider<H> {
    slots: Mutex<Slots<H>>,
}

impl<H> Default for StaticSamProvider<H> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(Slots {
                slots: Vec::new(),
                next_lease: 1,
            }),
        }
    }
}

impl<H: Send> StaticSamProvider<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: impl Into<String>, descriptor: SamDescriptor, handle: H) {
        self.slots.lock().slots.push(Slot {
            name: name.into(),
            descriptor,
            handle: Some(handle),
            lease: 0,
        });
    }

    /// Number of SAMs currently free
    pub fn available(&self) -> usize {
        self.slots.lock().slots.iter().filter(|slot| slot.handle.is_some()).count()
    }
}

impl<H: Send> SamProvider for StaticSamProvider<H> {
    type Handle = H;

    fn try_allocate(&self, identifier: &SamIdentifier) -> Option<SamResource<H>> {
        let mut guard = self.slots.lock();
        let lease = guard.next_lease;
        let slot = guard
            .slots
            .iter_mut()
            .find(|slot| slot.handle.is_some() && identifier.matches(&slot.descriptor))?;
        let handle = slot.handle.take()?;
        slot.lease = lease;
        let mut resource = SamResource::new(slot.name.clone(), slot.descriptor.clone(), handle);
        resource.slot_lease = lease;
        guard.next_lease += 1;
        Some(resource)
    }

    fn release(&self, resource: SamResource<H>) -> Result<(), PoolError> {
        let mut guard = self.slots.lock();
        let slot = guard.slots.iter_mut().find(|slot| {
            slot.name == resource.name && slot.handle.is_none() && slot.lease == resource.slot_lease
        });
        match slot {
            Some(slot) if resource.slot_lease != 0 => {
                slot.handle = Some(resource.handle);
                slot.lease = 0;
                Ok(())
            }
            _ => Err(PoolError::NotAllocated(resource.name)),
        }
    }
}

/// Whether `allocate` may wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Longest wait between two provider polls while blocked
    pub poll_interval: Duration,
    /// Timeout used by [`SamResourcePool::allocate_blocking`]
    pub default_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            default_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct PoolState {
    /// Pool lease of every SAM handed out, by name
    allocated: HashMap<String, u64>,
    next_lease: u64,
    cancel_epoch: u64,
}

/// Concurrent SAM allocator
pub struct SamResourcePool<P: SamProvider> {
    provider: P,
    config: PoolConfig,
    state: Mutex<PoolState>,
    released: Condvar,
}

impl<P: SamProvider> SamResourcePool<P> {
    pub fn new(provider: P) -> Self {
        Self::with_config(provider, PoolConfig::default())
    }

    pub fn with_config(provider: P, config: PoolConfig) -> Self {
        Self {
            provider,
            config,
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Allocate a matching SAM, waiting at most `timeout` in blocking mode
    pub fn allocate(
        &self,
        identifier: &SamIdentifier,
        mode: AllocationMode,
        timeout: Duration,
    ) -> Result<SamResource<P::Handle>, PoolError> {
        let started = Instant::now();
        // Too far out to represent means no deadline
        let deadline = started.checked_add(timeout);
        let mut state = self.state.lock();
        let epoch = state.cancel_epoch;

        loop {
            if let Some(mut resource) = self.provider.try_allocate(identifier) {
                state.next_lease += 1;
                resource.pool_lease = state.next_lease;
                state.allocated.insert(resource.name.clone(), resource.pool_lease);
                debug!(
                    sam = %resource.name,
                    group = identifier.group_reference(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "SAM allocated"
                );
                return Ok(resource);
            }

            if mode == AllocationMode::NonBlocking {
                return Err(PoolError::NoResourceAvailable(identifier.group_reference.clone()));
            }

            let now = Instant::now();
            let wait = match deadline {
                Some(deadline) if now >= deadline => {
                    let group = identifier.group_reference();
                    warn!(group, ?timeout, "SAM allocation timed out");
                    return Err(PoolError::AllocationTimeout(timeout));
                }
                Some(deadline) => (deadline - now).min(self.config.poll_interval),
                None => self.config.poll_interval,
            };
            self.released.wait_for(&mut state, wait);

            if state.cancel_epoch != epoch {
                debug!(group = identifier.group_reference(), "SAM allocation cancelled");
                return Err(PoolError::Cancelled);
            }
        }
    }

    /// Blocking allocation bounded by the configured default timeout
    pub fn allocate_blocking(
        &self,
        identifier: &SamIdentifier,
    ) -> Result<SamResource<P::Handle>, PoolError> {
        self.allocate(identifier, AllocationMode::Blocking, self.config.default_timeout)
    }

    /// Return a SAM obtained from this pool
    pub fn release(&self, resource: SamResource<P::Handle>) -> Result<(), PoolError> {
        let mut state = self.state.lock();
        let lease = resource.pool_lease;
        if lease == 0 || state.allocated.get(&resource.name) != Some(&lease) {
            warn!(sam = %resource.name, "release of a SAM not allocated by this pool");
            return Err(PoolError::NotAllocated(resource.name));
        }
        let name = resource.name.clone();
        // Still held if the provider refuses it
        self.provider.release(resource)?;
        state.allocated.remove(&name);
        drop(state);

        self.released.notify_all();
        debug!(sam = %name, "SAM released");
        Ok(())
    }

    /// Fail every allocation currently waiting with [`PoolError::Cancelled`]
    pub fn cancel(&self) {
        self.state.lock().cancel_epoch += 1;
        self.released.notify_all();
    }

    /// Number of SAMs handed out and not yet released
    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated.len()
    }
}
