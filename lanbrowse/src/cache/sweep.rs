use std::collections::HashMap;
use std::vec;
use shared::types::{InstanceKey, ServiceInstance};
use super::Entry;

/// Iterator over instances removed by a TTL sweep.
///
/// Each `next()` removes one snapshotted key and yields the instance in the
/// `Expired` state.
pub struct Sweep<'a> {
    entries: &'a mut HashMap<InstanceKey, Entry>,
    expired: vec::IntoIter<InstanceKey>,
}

impl<'a> Sweep<'a> {
    pub(super) fn new(entries: &'a mut HashMap<InstanceKey, Entry>, expired: Vec<InstanceKey>) -> Self {
        Self {
            entries,
            expired: expired.into_iter(),
        }
    }
}

impl Iterator for Sweep<'_> {
    type Item = ServiceInstance;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.expired.by_ref() {
            if let Some(entry) = self.entries.remove(&key) {
                let mut instance = entry.instance;
                instance.expire();
                return Some(instance);
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.expired.len()))
    }
}
