use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use shared::types::{InstanceKey, ResolvedEndpoint};
use crate::cache::ServiceCache;
use crate::error::{DiscoveryError, Result};
use crate::wire::{self, Query};

/// Where a resolve outcome is delivered
pub type Reply = oneshot::Sender<Result<Arc<ResolvedEndpoint>>>;

/// What a resolve request turned into
#[derive(Debug)]
pub enum Outcome {
    /// Answered from inline data already in the cache
    Cached,
    /// No such instance in the cache
    NotFound,
    /// Coalesced onto an exchange already in flight
    Joined,
    /// A new exchange started; the query must go out on the transport
    Query(Query),
    /// The query could not be built; the waiter already has the error
    Failed,
}

struct Pending {
    deadline: Instant,
    waiters: Vec<Reply>,
}

/// In-flight resolve exchanges and their waiters. Owns no socket; the
/// session sends the queries it asks for.
pub struct Resolver {
    window: Duration,
    pending: HashMap<InstanceKey, Pending>,
}

impl Resolver {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: HashMap::new(),
        }
    }

    /// Starts or joins resolution of `key`. `waiter` is `None` for eager
    /// resolution nobody waits on.
    pub fn request(
        &mut self,
        cache: &ServiceCache,
        key: &InstanceKey,
        waiter: Option<Reply>,
        now: Instant,
    ) -> Outcome {
        let Some(instance) = cache.lookup(key) else {
            reply(waiter, Err(DiscoveryError::InstanceNotFound(key.full_name())));
            return Outcome::NotFound;
        };

        if let Some(endpoint) = instance.endpoint() {
            reply(waiter, Ok(endpoint.clone()));
            return Outcome::Cached;
        }

        if let Some(pending) = self.pending.get_mut(key) {
            pending.waiters.extend(waiter);
            return Outcome::Joined;
        }

        let Some(name) = wire::instance_name(key) else {
            reply(waiter, Err(DiscoveryError::InstanceNotFound(key.full_name())));
            return Outcome::NotFound;
        };

        let query = match wire::encode_resolve_query(&name) {
            Ok(query) => query,
            Err(e) => {
                reply(waiter, Err(DiscoveryError::SendFailed(e.to_string())));
                return Outcome::Failed;
            }
        };

        self.pending.insert(
            key.clone(),
            Pending {
                deadline: now + self.window,
                waiters: waiter.into_iter().collect(),
            },
        );
        Outcome::Query(query)
    }

    /// Hands `endpoint` to everyone waiting on `key`. Returns false when no
    /// exchange was in flight.
    pub fn complete(&mut self, key: &InstanceKey, endpoint: &Arc<ResolvedEndpoint>) -> bool {
        let Some(pending) = self.pending.remove(key) else {
            return false;
        };
        for waiter in pending.waiters {
            let _ = waiter.send(Ok(endpoint.clone()));
        }
        true
    }

    pub fn fail(&mut self, key: &InstanceKey, err: DiscoveryError) -> bool {
        let Some(pending) = self.pending.remove(key) else {
            return false;
        };
        for waiter in pending.waiters {
            let _ = waiter.send(Err(err.clone()));
        }
        true
    }

    /// Fails every exchange whose window closed at or before `now` with
    /// `ResolutionTimeout`; returns the keys that timed out
    pub fn expire(&mut self, now: Instant) -> Vec<InstanceKey> {
        let expired: Vec<InstanceKey> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            let err = DiscoveryError::ResolutionTimeout {
                instance: key.full_name(),
                waited: self.window,
            };
            self.fail(key, err);
        }
        expired
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    /// Fails everything in flight with `Cancelled`
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(DiscoveryError::Cancelled));
            }
        }
    }
}

fn reply(waiter: Option<Reply>, result: Result<Arc<ResolvedEndpoint>>) {
    if let Some(waiter) = waiter {
        let _ = waiter.send(result);
    }
}
