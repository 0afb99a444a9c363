//! Process-wide state manager slot.
//!
//! The host registers a factory once at startup; the first
//! [`get_state_manager`] call constructs the manager and every later call
//! returns the same instance. Registering again replaces the slot and drops
//! the constructed instance, which test harnesses use to start fresh.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{BridgeError, Result};
use crate::traits::StateManager;

type Factory = Box<dyn Fn() -> Arc<dyn StateManager> + Send + Sync>;

struct Slot {
    factory: Factory,
    instance: Option<Arc<dyn StateManager>>,
}

static SLOT: RwLock<Option<Slot>> = parking_lot::const_rwlock(None);

pub fn register_state_manager<F>(factory: F)
where
    F: Fn() -> Arc<dyn StateManager> + Send + Sync + 'static,
{
    *SLOT.write() = Some(Slot {
        factory: Box::new(factory),
        instance: None,
    });
    tracing::debug!("state manager factory registered");
}

/// The shared state manager.
///
/// Fails with [`BridgeError::NotRegistered`] before
/// [`register_state_manager`] has been called.
pub fn get_state_manager() -> Result<Arc<dyn StateManager>> {
    if let Some(slot) = SLOT.read().as_ref()
        && let Some(instance) = &slot.instance
    {
        return Ok(instance.clone());
    }

    let mut guard = SLOT.write();
    let slot = guard.as_mut().ok_or(BridgeError::NotRegistered)?;
    // Another caller may have constructed it between the two locks.
    let instance = slot
        .instance
        .get_or_insert_with(|| (slot.factory)())
        .clone();
    Ok(instance)
}

pub fn is_state_manager_registered() -> bool {
    SLOT.read().is_some()
}
