//! Object registry.
//!
//! Maps live objects to the integer handles clients use to refer to them.
//! Handle 0 is reserved for the null reference. The registry keeps every
//! registered object alive, so an identity is never recycled while its
//! handle exists.

use crate::codec::ObjectRef;
use crate::CodecError;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug)]
pub struct ObjectRegistry {
    handles: HashMap<usize, u64>,
    objects: HashMap<u64, ObjectRef>,
    next_handle: u64,
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            handles: HashMap::new(),
            objects: HashMap::new(),
            next_handle: 1,
        }
    }

    /// Get the handle for `object`, allocating one on first sight.
    pub fn handle_for(&mut self, object: &ObjectRef) -> u64 {
        let identity = object.identity();
        if let Some(handle) = self.handles.get(&identity) {
            return *handle;
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(identity, handle);
        self.objects.insert(handle, object.clone());
        handle
    }

    /// Resolve a handle. Handle 0 is the null reference.
    pub fn resolve(&self, handle: u64) -> Result<Option<ObjectRef>, CodecError> {
        if handle == 0 {
            return Ok(None);
        }
        self.objects
            .get(&handle)
            .cloned()
            .map(Some)
            .ok_or(CodecError::UnknownHandle(handle))
    }

    /// Drop every mapping.
    ///
    /// Handles are not reissued afterwards, so a stale handle held by a
    /// client fails to resolve instead of aliasing a new object.
    pub fn reset(&mut self) {
        debug!("Resetting object registry ({} objects)", self.objects.len());
        self.handles.clear();
        self.objects.clear();
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
