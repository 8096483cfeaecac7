use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::types::{Event, InstanceKey, ResolvedEndpoint, ServiceInstance, SessionErrorKind};
use crate::cache::{Delta, ServiceCache, ServiceTypeCache, TypeDelta};
use crate::config::SessionConfig;
use crate::error::{DecodeError, DiscoveryError, TransportError};
use crate::listener::Listener;
use crate::resolver::{Outcome, Reply, Resolver};
use crate::scheduler::{Schedule, Tick};
use crate::transport::{Datagram, Membership, Transport};
use crate::wire::{self, Name, Query, Response};
use super::{Browse, Command, SessionState, SessionStats};

/// Why the worker loop ended
enum Exit {
    Cancelled,
    Failed(SessionErrorKind, String),
}

type Step = std::result::Result<(), Exit>;

fn send_failure(err: TransportError) -> Exit {
    Exit::Failed(SessionErrorKind::SendFailed, err.to_string())
}

pub(super) struct Worker<T: Transport> {
    transport: Arc<T>,
    membership: Membership,
    browse: Browse,
    domain: String,
    query_name: Name,
    schedule: Schedule,
    auto_resolve: bool,
    cache: ServiceCache,
    types: ServiceTypeCache,
    resolver: Resolver,
    listener: Arc<dyn Listener>,
    stats: Arc<SessionStats>,
    state: Arc<watch::Sender<SessionState>>,
}

impl<T: Transport> Worker<T> {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        transport: Arc<T>,
        membership: Membership,
        browse: Browse,
        query_name: Name,
        config: &SessionConfig,
        listener: Arc<dyn Listener>,
        stats: Arc<SessionStats>,
        state: Arc<watch::Sender<SessionState>>,
    ) -> Self {
        Self {
            transport,
            membership,
            browse,
            domain: config.domain.trim_end_matches('.').to_ascii_lowercase(),
            query_name,
            schedule: Schedule::new(config.query_schedule(), config.sweep_interval()),
            auto_resolve: config.auto_resolve,
            cache: ServiceCache::new(),
            types: ServiceTypeCache::new(),
            resolver: Resolver::new(config.resolve_timeout()),
            listener,
            stats,
            state,
        }
    }

    pub(super) async fn run(mut self, cancel: CancellationToken, mut commands: mpsc::Receiver<Command>) {
        let exit = loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Exit::Cancelled),
                tick = self.schedule.next(self.resolver.next_deadline()) => self.on_tick(tick).await,
                Some(command) = commands.recv() => self.on_command(command).await,
                received = self.transport.receive(&mut self.membership) => match received {
                    Ok(datagram) => self.on_datagram(&datagram).await,
                    Err(TransportError::Closed) => {
                        Err(Exit::Failed(SessionErrorKind::TransportClosed, TransportError::Closed.to_string()))
                    }
                    Err(e) => Err(Exit::Failed(SessionErrorKind::ReceiveFailed, e.to_string())),
                },
            };
            if let Err(exit) = step {
                break exit;
            }
        };

        self.resolver.cancel_all();

        match exit {
            Exit::Cancelled => {
                self.transport.leave(self.membership).await;
            }
            Exit::Failed(kind, detail) => {
                tracing::error!(browse = %self.browse, ?kind, "Session failed: {}", detail);
                self.listener.on_event(Event::SessionError { kind, detail });
                self.transport.leave(self.membership).await;
                self.state.send_replace(SessionState::Idle);
            }
        }
    }

    async fn on_tick(&mut self, tick: Tick) -> Step {
        let now = Instant::now();
        match tick {
            Tick::Query => {
                let known = match self.browse {
                    Browse::Instances(_) => self.cache.known_answers(now),
                    Browse::ServiceTypes => self.types.known_answers(now),
                };
                let query = match wire::encode_query(&self.query_name, &known) {
                    Ok(query) => query,
                    Err(e) => {
                        tracing::warn!(name = %self.query_name, "Skipping browse query: {}", e);
                        return Ok(());
                    }
                };
                self.send(&query).await.map_err(send_failure)?;
                tracing::trace!(
                    name = %self.query_name,
                    id = query.id,
                    known = known.len(),
                    packets = query.packets.len(),
                    "Browse query sent"
                );
            }
            Tick::Sweep => {
                for instance in self.cache.sweep(now) {
                    let key = instance.key().clone();
                    tracing::debug!(instance = %key, "Service expired");
                    self.resolver.fail(&key, DiscoveryError::InstanceNotFound(key.full_name()));
                    self.listener.on_event(Event::ServiceLost(key));
                }
                for (service_type, domain) in self.types.sweep(now) {
                    tracing::debug!(%service_type, %domain, "Service type expired");
                    self.listener.on_event(Event::ServiceTypeLost { service_type, domain });
                }
            }
            Tick::ResolveDeadline => {
                for key in self.resolver.expire(now) {
                    tracing::debug!(instance = %key, "Resolve timed out");
                    self.cache.mark_unresolved(&key);
                    SessionStats::bump(&self.stats.resolve_timeouts);
                }
            }
        }
        Ok(())
    }

    async fn on_command(&mut self, command: Command) -> Step {
        match command {
            Command::Resolve { key, reply } => self.resolve(key, Some(reply), Instant::now()).await?,
            Command::Lookup { key, reply } => {
                let _ = reply.send(self.cache.lookup(&key).cloned());
            }
            Command::Snapshot { reply } => {
                let mut instances: Vec<ServiceInstance> = self.cache.instances().cloned().collect();
                instances.sort_by(|a, b| a.key().name.cmp(&b.key().name));
                let _ = reply.send(instances);
            }
        }
        Ok(())
    }

    async fn on_datagram(&mut self, datagram: &Datagram) -> Step {
        SessionStats::bump(&self.stats.datagrams);

        let response = match wire::decode_response(&datagram.bytes) {
            Ok(response) => response,
            Err(DecodeError::NotResponse) => {
                tracing::trace!(source = %datagram.source, "Ignoring query");
                return Ok(());
            }
            Err(e) => {
                SessionStats::bump(&self.stats.malformed);
                tracing::debug!(source = %datagram.source, "Dropping malformed packet: {}", e);
                return Ok(());
            }
        };

        let now = Instant::now();
        match self.browse {
            Browse::Instances(_) => self.merge_instances(response, now).await,
            Browse::ServiceTypes => {
                self.merge_types(response, now);
                Ok(())
            }
        }
    }

    /// Other browsers share the group; their answers are not ours
    fn is_ours(&self, key: &InstanceKey) -> bool {
        matches!(&self.browse, Browse::Instances(service_type) if *service_type == key.service_type)
            && key.domain == self.domain
    }

    async fn merge_instances(&mut self, response: Response, now: Instant) -> Step {
        for advertisement in response.advertisements {
            if !self.is_ours(&advertisement.key) {
                continue;
            }
            let delta = self.cache.merge(advertisement, now);
            self.apply(delta, now).await?;
        }

        // TXT and address records announced on their own, e.g. after the
        // responder changed its attributes
        for update in response.attributes {
            if !self.is_ours(&update.key) {
                continue;
            }
            let delta = self.cache.update_attributes(&update.key, &update.txt);
            self.apply(delta, now).await?;
        }
        for update in response.addresses {
            for delta in self.cache.update_addresses(&update) {
                self.apply(delta, now).await?;
            }
        }
        Ok(())
    }

    fn merge_types(&mut self, response: Response, now: Instant) {
        for advertisement in response.service_types {
            if advertisement.domain != self.domain {
                continue;
            }
            match self.types.merge(advertisement, now) {
                TypeDelta::Found(service_type, domain) => {
                    tracing::debug!(%service_type, %domain, "Service type found");
                    self.listener.on_event(Event::ServiceTypeFound { service_type, domain });
                }
                TypeDelta::Lost(service_type, domain) => {
                    tracing::debug!(%service_type, %domain, "Service type withdrawn");
                    self.listener.on_event(Event::ServiceTypeLost { service_type, domain });
                }
                TypeDelta::NoChange => {}
            }
        }
    }

    async fn send(&self, query: &Query) -> std::result::Result<(), TransportError> {
        for packet in &query.packets {
            self.transport.send(&self.membership, packet).await?;
        }
        SessionStats::bump(&self.stats.queries_sent);
        Ok(())
    }

    /// Turns one cache delta into listener events
    async fn apply(&mut self, delta: Delta, now: Instant) -> Step {
        match delta {
            Delta::Found(instance) => {
                let key = instance.key().clone();
                let endpoint = instance.endpoint().cloned();
                tracing::debug!(instance = %key, ttl = instance.ttl(), "Service found");
                self.listener.on_event(Event::ServiceFound(instance));

                match endpoint {
                    Some(endpoint) => self.resolved(key, endpoint),
                    None if self.auto_resolve => self.resolve(key, None, now).await?,
                    None => {}
                }
            }
            Delta::Resolved(instance) => {
                if let Some(endpoint) = instance.endpoint().cloned() {
                    self.resolved(instance.key().clone(), endpoint);
                }
            }
            Delta::Updated(instance) => {
                tracing::debug!(instance = %instance.key(), "Service updated");
                if let Some(endpoint) = instance.endpoint() {
                    self.resolver.complete(instance.key(), endpoint);
                }
                self.listener.on_event(Event::ServiceUpdated(instance));
            }
            Delta::Lost(key) => {
                tracing::debug!(instance = %key, "Service withdrawn");
                self.resolver.fail(&key, DiscoveryError::InstanceNotFound(key.full_name()));
                self.listener.on_event(Event::ServiceLost(key));
            }
            Delta::NoChange => {}
        }
        Ok(())
    }

    fn resolved(&mut self, key: InstanceKey, endpoint: Arc<ResolvedEndpoint>) {
        tracing::debug!(instance = %key, endpoint = %endpoint.connection_string(), "Service resolved");
        self.resolver.complete(&key, &endpoint);
        self.listener.on_event(Event::ServiceResolved { key, endpoint });
    }

    async fn resolve(&mut self, key: InstanceKey, waiter: Option<Reply>, now: Instant) -> Step {
        match self.resolver.request(&self.cache, &key, waiter, now) {
            Outcome::Query(query) => {
                self.cache.mark_resolving(&key);
                tracing::debug!(instance = %key, id = query.id, "Resolving");
                if let Err(e) = self.send(&query).await {
                    self.resolver.fail(&key, DiscoveryError::SendFailed(e.to_string()));
                    self.cache.mark_unresolved(&key);
                    return Err(send_failure(e));
                }
            }
            Outcome::Joined => {
                tracing::trace!(instance = %key, "Joined resolve in flight");
            }
            Outcome::Failed => {
                tracing::warn!(instance = %key, "Cannot build resolve query");
            }
            Outcome::Cached | Outcome::NotFound => {}
        }
        Ok(())
    }
}
