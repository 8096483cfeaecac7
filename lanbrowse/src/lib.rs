pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod listener;
pub mod resolver;
pub mod scheduler;
pub mod session;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use engine::{DiscoveryEngine, SessionId, SessionInfo};
pub use error::{DiscoveryError, Result};
pub use listener::Listener;
pub use session::{Browse, DiscoverySession, SessionState, StatsSnapshot};
pub use transport::{MemoryTransport, Transport, UdpTransport};
