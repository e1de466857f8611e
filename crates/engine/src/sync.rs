//! Hook for collaborators that push extra state onto freshly realized objects.

use crate::backend::BackendHandle;
use crate::registry::InstanceKey;

/// Notified once per realization of an instance, and again whenever a
/// feature requests a resync of its entity.
///
/// Typical implementors apply access locks or similar non-spatial attributes
/// to the new engine object.
pub trait AccessSynchronizer: Send {
    fn on_realized(&mut self, key: InstanceKey, handle: BackendHandle);
}

/// Synchronizer for categories that carry no extra state.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSynchronizer;

impl AccessSynchronizer for NoopSynchronizer {
    fn on_realized(&mut self, _key: InstanceKey, _handle: BackendHandle) {}
}

impl<F> AccessSynchronizer for F
where
    F: FnMut(InstanceKey, BackendHandle) + Send,
{
    fn on_realized(&mut self, key: InstanceKey, handle: BackendHandle) {
        self(key, handle)
    }
}
