mod sweep;
mod types;

use std::collections::hash_map::Entry as Slot;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use shared::types::{InstanceKey, ResolvedEndpoint, ServiceInstance, TxtRecord};
use crate::wire::{self, AddressUpdate, KnownAnswer, ServiceAdvertisement};

pub use sweep::Sweep;
pub use types::{ServiceTypeCache, TypeDelta};

/// Outcome of merging one advertisement
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// First sighting of the key
    Found(ServiceInstance),
    /// Endpoint attached to an instance that had none
    Resolved(ServiceInstance),
    /// Endpoint replaced by a different one
    Updated(ServiceInstance),
    /// Explicit withdrawal of a known instance
    Lost(InstanceKey),
    /// Refresh only: deadline moved, nothing observable changed
    NoChange,
}

struct Entry {
    instance: ServiceInstance,
    deadline: Instant,
}

/// Swaps in `endpoint` when it differs from the one held
fn attach(instance: &mut ServiceInstance, endpoint: Arc<ResolvedEndpoint>) -> Delta {
    let resolved = instance.endpoint().is_none();
    if !resolved && instance.endpoint() == Some(&endpoint) {
        return Delta::NoChange;
    }
    instance.attach_endpoint(endpoint);
    if resolved {
        Delta::Resolved(instance.clone())
    } else {
        Delta::Updated(instance.clone())
    }
}

fn same_addresses(a: &[IpAddr], b: &[IpAddr]) -> bool {
    a.len() == b.len() && a.iter().all(|addr| b.contains(addr))
}

/// In-memory instance store, owned by one session worker
#[derive(Default)]
pub struct ServiceCache {
    entries: HashMap<InstanceKey, Entry>,
}

impl ServiceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges an advertisement received at `now`.
    ///
    /// The deadline becomes `now + ttl` of this advertisement; it is never
    /// moved without one. A TTL of zero withdraws the instance.
    pub fn merge(&mut self, advertisement: ServiceAdvertisement, now: Instant) -> Delta {
        if advertisement.is_withdrawal() {
            return match self.withdraw(&advertisement.key) {
                Some(key) => Delta::Lost(key),
                None => Delta::NoChange,
            };
        }

        let deadline = now + Duration::from_secs(u64::from(advertisement.ttl));
        let entry = match self.entries.entry(advertisement.key.clone()) {
            Slot::Vacant(slot) => {
                let instance = ServiceInstance::new(
                    advertisement.key,
                    advertisement.ttl,
                    advertisement.endpoint,
                );
                slot.insert(Entry {
                    instance: instance.clone(),
                    deadline,
                });
                return Delta::Found(instance);
            }
            Slot::Occupied(slot) => slot.into_mut(),
        };

        entry.deadline = deadline;
        entry.instance.refresh(advertisement.ttl);

        match advertisement.endpoint {
            Some(endpoint) => attach(&mut entry.instance, endpoint),
            // PTR-only refresh keeps whatever endpoint is held
            None => Delta::NoChange,
        }
    }

    /// Replaces the TXT attributes of a resolved instance. The deadline
    /// stays put; it follows the PTR lifetime only.
    pub fn update_attributes(&mut self, key: &InstanceKey, txt: &TxtRecord) -> Delta {
        let Some(entry) = self.entries.get_mut(key) else {
            return Delta::NoChange;
        };
        let endpoint = match entry.instance.endpoint() {
            Some(current) if &current.txt != txt => ResolvedEndpoint {
                txt: txt.clone(),
                ..ResolvedEndpoint::clone(current)
            },
            // nothing to attach attributes to, or nothing new
            _ => return Delta::NoChange,
        };
        attach(&mut entry.instance, Arc::new(endpoint))
    }

    /// Applies address records to every resolved instance whose SRV target
    /// is `update.host`. Cache-flush records replace the held addresses;
    /// others add to them.
    pub fn update_addresses(&mut self, update: &AddressUpdate) -> Vec<Delta> {
        let mut changed: Vec<(String, Delta)> = Vec::new();
        for entry in self.entries.values_mut() {
            let endpoint = match entry.instance.endpoint() {
                Some(current) if current.target.eq_ignore_ascii_case(&update.host) => {
                    let mut addresses = if update.flush {
                        Vec::new()
                    } else {
                        current.addresses.clone()
                    };
                    for addr in &update.addresses {
                        if !addresses.contains(addr) {
                            addresses.push(*addr);
                        }
                    }
                    if same_addresses(&addresses, &current.addresses) {
                        continue;
                    }
                    ResolvedEndpoint {
                        addresses,
                        ..ResolvedEndpoint::clone(current)
                    }
                }
                _ => continue,
            };
            let name = entry.instance.key().name.clone();
            changed.push((name, attach(&mut entry.instance, Arc::new(endpoint))));
        }
        changed.sort_by(|a, b| a.0.cmp(&b.0));
        changed.into_iter().map(|(_, delta)| delta).collect()
    }

    /// Removes an instance; returns its key if it was present
    pub fn withdraw(&mut self, key: &InstanceKey) -> Option<InstanceKey> {
        self.entries.remove_entry(key).map(|(key, _)| key)
    }

    pub fn lookup(&self, key: &InstanceKey) -> Option<&ServiceInstance> {
        self.entries.get(key).map(|entry| &entry.instance)
    }

    #[cfg(test)]
    fn deadline(&self, key: &InstanceKey) -> Option<Instant> {
        self.entries.get(key).map(|entry| entry.deadline)
    }

    /// Lazily removes instances whose deadline has passed. An instance is
    /// still alive at exactly `refresh + ttl`.
    ///
    /// Expired keys are snapshotted when the sweep starts, earliest deadline
    /// first. Dropping the iterator early leaves the rest for the next sweep.
    pub fn sweep(&mut self, now: Instant) -> Sweep<'_> {
        let mut expired: Vec<(Instant, InstanceKey)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline < now)
            .map(|(key, entry)| (entry.deadline, key.clone()))
            .collect();
        expired.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));

        Sweep::new(&mut self.entries, expired.into_iter().map(|(_, key)| key).collect())
    }

    pub fn mark_resolving(&mut self, key: &InstanceKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.instance.mark_resolving();
        }
    }

    pub fn mark_unresolved(&mut self, key: &InstanceKey) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.instance.mark_unresolved();
        }
    }

    /// Entries worth listing in a browse query: remaining TTL above half the
    /// advertised TTL (RFC 6762 §7.1)
    pub fn known_answers(&self, now: Instant) -> Vec<KnownAnswer> {
        self.entries
            .values()
            .filter_map(|entry| {
                let remaining = entry.deadline.saturating_duration_since(now).as_secs();
                if remaining * 2 <= u64::from(entry.instance.ttl()) {
                    return None;
                }
                Some(KnownAnswer {
                    target: wire::instance_name(entry.instance.key())?,
                    remaining_ttl: remaining as u32,
                })
            })
            .collect()
    }

    pub fn instances(&self) -> impl Iterator<Item = &ServiceInstance> {
        self.entries.values().map(|entry| &entry.instance)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
