mod worker;

use std::fmt;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::protocol::META_QUERY_TYPE;
use shared::types::{InstanceKey, ParseServiceTypeError, ResolvedEndpoint, ServiceInstance, ServiceType};
use crate::config::SessionConfig;
use crate::error::{DiscoveryError, Result};
use crate::listener::Listener;
use crate::resolver::Reply;
use crate::transport::Transport;
use crate::wire::{self, Name};
use worker::Worker;

/// What a session browses for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum Browse {
    /// Instances of one service type
    Instances(ServiceType),
    /// The service types present on the link (RFC 6763 §9)
    ServiceTypes,
}

impl Browse {
    /// Parses `"_http._tcp"` or `"_services._dns-sd._udp"`, either optionally
    /// followed by a domain. The domain comes back lowercase without the
    /// trailing dot.
    pub fn parse_qualified(input: &str) -> std::result::Result<(Self, Option<String>), ParseServiceTypeError> {
        let trimmed = input.trim().trim_end_matches('.');
        let is_meta = trimmed
            .get(..META_QUERY_TYPE.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(META_QUERY_TYPE));
        if is_meta {
            return match &trimmed[META_QUERY_TYPE.len()..] {
                "" => Ok((Browse::ServiceTypes, None)),
                rest => match rest.strip_prefix('.') {
                    Some(domain) if !domain.split('.').any(str::is_empty) => {
                        Ok((Browse::ServiceTypes, Some(domain.to_ascii_lowercase())))
                    }
                    _ => Err(ParseServiceTypeError::EmptyLabel(input.to_string())),
                },
            };
        }

        let (service_type, domain) = ServiceType::parse_qualified(input)?;
        Ok((Browse::Instances(service_type), domain))
    }

    fn query_name(&self, domain: &str) -> Option<Name> {
        match self {
            Browse::Instances(service_type) => wire::service_name(service_type, domain),
            Browse::ServiceTypes => wire::meta_query_name(domain),
        }
    }
}

impl From<ServiceType> for Browse {
    fn from(service_type: ServiceType) -> Self {
        Browse::Instances(service_type)
    }
}

impl fmt::Display for Browse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Browse::Instances(service_type) => fmt::Display::fmt(service_type, f),
            Browse::ServiceTypes => f.write_str(META_QUERY_TYPE),
        }
    }
}

impl From<Browse> for String {
    fn from(browse: Browse) -> Self {
        browse.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Listening,
    Stopping,
}

/// Counters kept across the lifetime of a session
#[derive(Debug, Default)]
pub struct SessionStats {
    datagrams: AtomicU64,
    malformed: AtomicU64,
    queries_sent: AtomicU64,
    resolve_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub datagrams: u64,
    pub malformed: u64,
    pub queries_sent: u64,
    pub resolve_timeouts: u64,
}

impl SessionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            queries_sent: self.queries_sent.load(Ordering::Relaxed),
            resolve_timeouts: self.resolve_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Requests served by the worker
enum Command {
    Resolve {
        key: InstanceKey,
        reply: Reply,
    },
    Lookup {
        key: InstanceKey,
        reply: oneshot::Sender<Option<ServiceInstance>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ServiceInstance>>,
    },
}

struct Running {
    cancel: CancellationToken,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// One listen/stop lifecycle. A spawned worker is the only writer of the
/// cache; resolve, lookup and snapshot reach it over a command channel.
pub struct DiscoverySession<T: Transport> {
    transport: Arc<T>,
    group: SocketAddrV4,
    config: SessionConfig,
    state: Arc<watch::Sender<SessionState>>,
    stats: Arc<SessionStats>,
    /// Serializes listen and stop; the worker never takes it
    running: Mutex<Option<Running>>,
}

impl<T: Transport> DiscoverySession<T> {
    pub fn new(transport: Arc<T>, group: SocketAddrV4, config: SessionConfig) -> Self {
        Self {
            transport,
            group,
            config,
            state: Arc::new(watch::Sender::new(SessionState::Idle)),
            stats: Arc::new(SessionStats::default()),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follows state changes, including the worker dropping to `Idle` after a
    /// transport failure
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn domain(&self) -> &str {
        &self.config.domain
    }

    /// Starts browsing. Valid only while `Idle`.
    pub async fn listen(&self, browse: impl Into<Browse>, listener: Arc<dyn Listener>) -> Result<()> {
        let browse = browse.into();
        let mut running = self.running.lock().await;
        if self.state() != SessionState::Idle {
            return Err(DiscoveryError::AlreadyListening);
        }
        // a worker that ended on a transport failure
        if let Some(previous) = running.take() {
            reap(previous.task).await;
        }

        let query_name = browse.query_name(&self.config.domain).ok_or_else(|| {
            ParseServiceTypeError::LabelTooLong(format!("{}.{}", browse, self.config.domain))
        })?;

        let membership = self.transport.join(self.group).await.map_err(|e| {
            tracing::warn!(group = %self.group, "Cannot join multicast group: {}", e);
            DiscoveryError::NetworkUnavailable(e.to_string())
        })?;

        self.state.send_replace(SessionState::Listening);
        tracing::info!(%browse, domain = %self.config.domain, "Listening");

        let cancel = CancellationToken::new();
        let (commands, command_rx) = mpsc::channel(64);
        let worker = Worker::new(
            self.transport.clone(),
            membership,
            browse,
            query_name,
            &self.config,
            listener,
            self.stats.clone(),
            self.state.clone(),
        );
        let task = tokio::spawn(worker.run(cancel.clone(), command_rx));

        *running = Some(Running {
            cancel,
            commands,
            task,
        });
        Ok(())
    }

    /// Stops browsing. Once this returns no further events are delivered and
    /// the group membership is released. A no-op while `Idle`.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return;
        };

        if self.state() == SessionState::Idle {
            reap(current.task).await;
            return;
        }

        self.state.send_replace(SessionState::Stopping);
        current.cancel.cancel();
        reap(current.task).await;
        self.state.send_replace(SessionState::Idle);
        tracing::info!(domain = %self.config.domain, "Stopped");
    }

    /// Resolves an instance to its endpoint. Concurrent calls for the same
    /// key share one network exchange and receive the same endpoint.
    pub async fn resolve(&self, key: InstanceKey) -> Result<Arc<ResolvedEndpoint>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Resolve { key, reply }).await?;
        rx.await.map_err(|_| DiscoveryError::Cancelled)?
    }

    pub async fn lookup(&self, key: InstanceKey) -> Result<Option<ServiceInstance>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Lookup { key, reply }).await?;
        rx.await.map_err(|_| DiscoveryError::Cancelled)
    }

    /// Every cached instance, ordered by instance name
    pub async fn snapshot(&self) -> Result<Vec<ServiceInstance>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| DiscoveryError::Cancelled)
    }

    async fn command(&self, command: Command) -> Result<()> {
        let commands = {
            let running = self.running.lock().await;
            match running.as_ref() {
                Some(current) if self.state() == SessionState::Listening => current.commands.clone(),
                _ => return Err(DiscoveryError::NotListening),
            }
        };
        commands
            .send(command)
            .await
            .map_err(|_| DiscoveryError::NotListening)
    }
}

async fn reap(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        tracing::error!("Session worker ended abnormally: {}", e);
    }
}

#[cfg(test)]
mod tests;
