use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;
use shared::types::{InstanceKey, ResolvedEndpoint};
use crate::config::Config;
use crate::error::{DiscoveryError, Result};
use crate::listener::Listener;
use crate::session::{Browse, DiscoverySession, SessionState};
use crate::transport::Transport;

/// Handle returned by [`DiscoveryEngine::listen`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub browse: Browse,
    pub domain: String,
    pub state: SessionState,
}

struct Entry<T: Transport> {
    browse: Browse,
    session: Arc<DiscoverySession<T>>,
}

/// One session per accepted `listen`, all sharing one transport
pub struct DiscoveryEngine<T: Transport> {
    transport: Arc<T>,
    config: Config,
    sessions: Mutex<HashMap<SessionId, Entry<T>>>,
}

impl<T: Transport> DiscoveryEngine<T> {
    pub fn new(transport: Arc<T>, config: Config) -> Self {
        Self {
            transport,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Starts browsing `service_type`, e.g. `"_http._tcp"` or
    /// `"_http._tcp.example.org."`. `"_services._dns-sd._udp"` lists the
    /// service types on the link instead. A domain in the string overrides
    /// the configured one.
    pub async fn listen(&self, service_type: &str, listener: Arc<dyn Listener>) -> Result<SessionId> {
        let (browse, domain) = Browse::parse_qualified(service_type)?;
        let mut config = self.config.session.clone();
        if let Some(domain) = domain {
            config.domain = domain;
        }

        let mut sessions = self.sessions.lock().await;
        // sessions that died on a transport failure no longer count
        sessions.retain(|_, entry| entry.session.state() != SessionState::Idle);

        let busy = sessions.values().any(|entry| {
            entry.browse == browse
                && entry.session.domain().eq_ignore_ascii_case(&config.domain)
        });
        if busy {
            return Err(DiscoveryError::AlreadyListening);
        }

        let session = Arc::new(DiscoverySession::new(
            self.transport.clone(),
            self.config.transport.group,
            config,
        ));
        session.listen(browse.clone(), listener).await?;

        let id = SessionId::new();
        tracing::info!(session = %id, %browse, "Session started");
        sessions.insert(id, Entry { browse, session });
        Ok(id)
    }

    /// Stops a session and forgets it
    pub async fn stop(&self, id: SessionId) -> Result<()> {
        let entry = self
            .sessions
            .lock()
            .await
            .remove(&id)
            .ok_or(DiscoveryError::NotListening)?;

        entry.session.stop().await;
        tracing::info!(session = %id, "Session stopped");
        Ok(())
    }

    pub async fn resolve(&self, id: SessionId, key: InstanceKey) -> Result<Arc<ResolvedEndpoint>> {
        self.session(id).await?.resolve(key).await
    }

    pub async fn session(&self, id: SessionId) -> Result<Arc<DiscoverySession<T>>> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .map(|entry| entry.session.clone())
            .ok_or(DiscoveryError::NotListening)
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                browse: entry.browse.clone(),
                domain: entry.session.domain().to_string(),
                state: entry.session.state(),
            })
            .collect();
        infos.sort_by(|a, b| a.browse.to_string().cmp(&b.browse.to_string()));
        infos
    }

    /// Stops every session
    pub async fn shutdown(&self) {
        let entries: Vec<(SessionId, Entry<T>)> = self.sessions.lock().await.drain().collect();
        for (id, entry) in entries {
            entry.session.stop().await;
            tracing::debug!(session = %id, "Session stopped on shutdown");
        }
    }
}
