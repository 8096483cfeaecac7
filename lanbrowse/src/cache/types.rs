use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use shared::types::ServiceType;
use crate::wire::{self, KnownAnswer, ServiceTypeAdvertisement};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeDelta {
    Found(ServiceType, String),
    Lost(ServiceType, String),
    NoChange,
}

struct TypeEntry {
    ttl: u32,
    deadline: Instant,
}

/// Service types seen through enumeration, with the same TTL rules as
/// instances
#[derive(Default)]
pub struct ServiceTypeCache {
    entries: HashMap<(ServiceType, String), TypeEntry>,
}

impl ServiceTypeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, advertisement: ServiceTypeAdvertisement, now: Instant) -> TypeDelta {
        let slot = (advertisement.service_type, advertisement.domain);
        if advertisement.ttl == 0 {
            return match self.entries.remove(&slot) {
                Some(_) => TypeDelta::Lost(slot.0, slot.1),
                None => TypeDelta::NoChange,
            };
        }

        let entry = TypeEntry {
            ttl: advertisement.ttl,
            deadline: now + Duration::from_secs(u64::from(advertisement.ttl)),
        };
        match self.entries.insert(slot.clone(), entry) {
            Some(_) => TypeDelta::NoChange,
            None => TypeDelta::Found(slot.0, slot.1),
        }
    }

    /// Removes types whose deadline has passed, earliest first
    pub fn sweep(&mut self, now: Instant) -> Vec<(ServiceType, String)> {
        let mut expired: Vec<(Instant, (ServiceType, String))> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline < now)
            .map(|(slot, entry)| (entry.deadline, slot.clone()))
            .collect();
        expired.sort_by_key(|(deadline, (service_type, domain))| {
            (*deadline, service_type.to_string(), domain.clone())
        });

        expired
            .into_iter()
            .filter_map(|(_, slot)| self.entries.remove_entry(&slot).map(|(slot, _)| slot))
            .collect()
    }

    /// PTR answers for the enumeration query, same half-TTL rule as instances
    pub fn known_answers(&self, now: Instant) -> Vec<KnownAnswer> {
        self.entries
            .iter()
            .filter_map(|((service_type, domain), entry)| {
                let remaining = entry.deadline.saturating_duration_since(now).as_secs();
                if remaining * 2 <= u64::from(entry.ttl) {
                    return None;
                }
                Some(KnownAnswer {
                    target: wire::service_name(service_type, domain)?,
                    remaining_ttl: remaining as u32,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
