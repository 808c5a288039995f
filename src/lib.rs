//! # paybill-agent
//!
//! An outbound bill-lookup client that behaves like a real browser session
//! instead of a script: rotating synthetic identities, upstream proxies,
//! adaptive pacing, and automatic recovery when the remote starts
//! rejecting traffic.
//!
//! ## Features
//!
//! - Pool of synthetic browser profiles with least-used selection
//! - Per-profile request ceilings, cooldowns, and temporary blocking
//! - Round-robin proxy rotation with failure tracking
//! - Rolling hourly quota and adaptive delay scaling
//! - Browser-faithful headers and a randomized cookie jar per session
//! - Manual gzip/deflate/brotli body decoding
//!
//! ## Example
//!
//! ```no_run
//! use paybill_agent::BillAgent;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut agent = BillAgent::builder().build()?;
//!     let result = agent.query("PB12345678", None).await;
//!     println!("success={} status={:?}", result.success, result.status);
//!     Ok(())
//! }
//! ```

mod agent;

pub mod modules;
pub mod transport;

pub use crate::agent::{
    AgentConfig,
    AgentError,
    BillAgent,
    BillAgentBuilder,
    EndpointConfig,
    ErrorKind,
    QueryFailure,
    QueryResult,
    generate_phone,
};

pub use crate::transport::{
    BillRequest,
    BillTransport,
    RawResponse,
    ReqwestTransport,
    TransportError,
};

pub use crate::modules::{
    AgentEvent,
    AttemptEvent,
    BlockedEvent,
    BrowserFamily,
    DelayClass,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
    PoolConfig,
    Profile,
    ProfilePool,
    ProfileUsage,
    ProfileUsageView,
    ProxyEndpoint,
    ProxyPool,
    ProxyScheme,
    RateConfig,
    RateController,
    ResponseEvent,
    RetryEvent,
    RotationEvent,
    Session,
    SessionBuilder,
    SessionError,
    UsageSnapshot,
    decode_body,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
