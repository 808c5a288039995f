//! Cross-cutting services module
//!
//! Identity, proxy, pacing, session, and decoding services the agent
//! composes into its query pipeline.

pub mod decode;
pub mod events;
pub mod profiles;
pub mod proxy;
pub mod rate;
pub mod session;

// Re-export commonly used types
pub use decode::decode_body;
pub use events::{
    AgentEvent, AttemptEvent, BlockedEvent, EventDispatcher, EventHandler, LoggingHandler,
    ResponseEvent, RetryEvent, RotationEvent,
};
pub use profiles::{
    BrowserFamily, PoolConfig, Profile, ProfilePool, ProfileUsage, ProfileUsageView,
    UsageSnapshot,
};
pub use proxy::{ProxyEndpoint, ProxyPool, ProxyScheme};
pub use rate::{DelayClass, RateConfig, RateController};
pub use session::{Session, SessionBuilder, SessionError};
