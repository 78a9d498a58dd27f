//! Peripherals authorized for automatic connection.

use std::collections::BTreeSet;

use ddsync_types::PeripheralHandle;

/// In-memory set of paired peripherals.
///
/// Pairing is a local insert only; nothing is written to the device.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    handles: BTreeSet<PeripheralHandle>,
}

impl AllowList {
    /// An empty allow-list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peripheral. Returns `true` if it was not already present.
    pub fn insert(&mut self, handle: PeripheralHandle) -> bool {
        self.handles.insert(handle)
    }

    /// Remove a peripheral. Returns `true` if it was present.
    pub fn remove(&mut self, handle: &PeripheralHandle) -> bool {
        self.handles.remove(handle)
    }

    /// Whether a peripheral may be connected automatically.
    pub fn contains(&self, handle: &PeripheralHandle) -> bool {
        self.handles.contains(handle)
    }

    /// Paired peripherals in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &PeripheralHandle> {
        self.handles.iter()
    }

    /// Number of paired peripherals.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether nothing is paired.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<H: Into<PeripheralHandle>> FromIterator<H> for AllowList {
    fn from_iter<I: IntoIterator<Item = H>>(iter: I) -> Self {
        Self {
            handles: iter.into_iter().map(Into::into).collect(),
        }
    }
}
