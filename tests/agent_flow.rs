//! End-to-end pipeline tests against a scripted transport.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use paybill_agent::{
    AgentConfig, BillAgent, BillRequest, BillTransport, BrowserFamily, ErrorKind, PoolConfig,
    Profile, RawResponse, RateConfig, Session, TransportError,
};

/// Transport that replays a scripted sequence of outcomes and records which
/// profile each attempt used.
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
    calls: AtomicUsize,
    seen_profiles: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    fn new(script: Vec<Result<RawResponse, TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            seen_profiles: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn seen_profiles(&self) -> Vec<String> {
        self.seen_profiles.lock().unwrap().clone()
    }
}

#[async_trait]
impl BillTransport for ScriptedTransport {
    async fn send(
        &self,
        _request: &BillRequest,
        session: &Session,
    ) -> Result<RawResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_profiles
            .lock()
            .unwrap()
            .push(session.profile_id.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connect("script exhausted".into())))
    }
}

fn plain(status: u16, body: &str) -> RawResponse {
    RawResponse {
        status,
        content_encoding: None,
        content_type: Some("application/json".into()),
        body: Bytes::from(body.to_string()),
    }
}

fn gzipped(status: u16, body: &str) -> RawResponse {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(body.as_bytes()).unwrap();
    RawResponse {
        status,
        content_encoding: Some("gzip".into()),
        content_type: Some("application/json".into()),
        body: Bytes::from(encoder.finish().unwrap()),
    }
}

fn test_profile(id: &str) -> Profile {
    Profile {
        id: id.into(),
        name: format!("test {id}"),
        browser: BrowserFamily::Chrome,
        browser_version: "120.0.0.0".into(),
        user_agent: "Mozilla/5.0 test".into(),
        platform: "Win32".into(),
        screen: (1920, 1080),
        language: "en-US,en;q=0.9".into(),
        timezone: "Asia/Ho_Chi_Minh".into(),
        fingerprint_token: format!("fp-{id}"),
    }
}

/// Config with every time-based control zeroed so tests run instantly.
fn fast_config(profile_ids: &[&str]) -> AgentConfig {
    AgentConfig {
        rate: RateConfig {
            hourly_ceiling: 1000,
            min_spacing: Duration::ZERO,
            normal_delay: (0.0, 0.0),
            retry_delay: (0.0, 0.0),
            error_delay: (0.0, 0.0),
            max_delay: Duration::ZERO,
        },
        pool: PoolConfig {
            max_requests_per_profile: 1000,
            rotate_interval: Duration::from_secs(24 * 60 * 60),
            ..Default::default()
        },
        profiles: profile_ids.iter().map(|id| test_profile(id)).collect(),
        ..Default::default()
    }
}

fn agent_with(transport: Arc<ScriptedTransport>, config: AgentConfig) -> BillAgent {
    BillAgent::builder()
        .with_config(config)
        .with_transport(transport)
        .build()
        .unwrap()
}

#[tokio::test]
async fn gzip_success_decodes_and_parses() {
    let transport = ScriptedTransport::new(vec![Ok(gzipped(200, r#"{"ok":true}"#))]);
    let mut agent = agent_with(transport.clone(), fast_config(&["p1", "p2"]));

    let result = agent.query("PB12345678", None).await;
    assert!(result.success);
    assert_eq!(result.status, Some(200));
    assert_eq!(result.attempts, 1);
    assert_eq!(result.data.unwrap()["ok"], true);
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn detection_exhausts_attempts() {
    let transport = ScriptedTransport::new(vec![
        Ok(plain(403, "blocked")),
        Ok(plain(403, "blocked")),
        Ok(plain(403, "blocked")),
    ]);
    let mut agent = agent_with(transport.clone(), fast_config(&["p1", "p2", "p3"]));

    let result = agent.query("PB12345678", None).await;
    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Exhausted);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.status, Some(403));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test]
async fn repeated_429_blocks_single_profile_and_falls_back() {
    let transport = ScriptedTransport::new(vec![
        Ok(plain(429, "slow down")),
        Ok(plain(429, "slow down")),
        Ok(plain(429, "slow down")),
        Ok(plain(200, r#"{"ok":true}"#)),
    ]);
    let mut agent = agent_with(transport.clone(), fast_config(&["p1"]));

    let first = agent.query("PB12345678", None).await;
    assert!(!first.success);

    let snapshot = agent.usage_snapshot();
    assert!(snapshot.per_profile["p1"].blocked_until.is_some());
    assert!(!snapshot.per_profile["p1"].is_available);

    let second = agent.query("PB12345678", None).await;
    assert!(second.success);
    assert_eq!(second.profile_id.as_deref(), Some("fallback"));
    assert!(transport.seen_profiles().contains(&"fallback".to_string()));
}

#[tokio::test]
async fn transport_error_retries_with_fresh_identity() {
    let transport = ScriptedTransport::new(vec![
        Err(TransportError::Timeout),
        Ok(plain(200, r#"{"ok":true}"#)),
    ]);
    let mut agent = agent_with(transport.clone(), fast_config(&["p1", "p2"]));

    let result = agent.query("PB12345678", None).await;
    assert!(result.success);
    assert_eq!(result.attempts, 2);

    let seen = transport.seen_profiles();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0], seen[1]);

    // Transport failures do not count against a profile's error threshold.
    let snapshot = agent.usage_snapshot();
    assert_eq!(snapshot.per_profile[&seen[0]].errors_count, 0);
}

#[tokio::test]
async fn server_error_fails_without_retry() {
    let transport = ScriptedTransport::new(vec![Ok(plain(500, "boom"))]);
    let mut agent = agent_with(transport.clone(), fast_config(&["p1", "p2"]));

    let result = agent.query("PB12345678", None).await;
    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Http);
    assert_eq!(result.status, Some(500));
    assert_eq!(result.raw_preview.as_deref(), Some("boom"));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn invalid_json_fails_without_retry() {
    let transport = ScriptedTransport::new(vec![Ok(plain(200, "<html>maintenance</html>"))]);
    let mut agent = agent_with(transport.clone(), fast_config(&["p1", "p2"]));

    let result = agent.query("PB12345678", None).await;
    assert!(!result.success);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Parse);
    assert_eq!(result.status, Some(200));
    assert!(result.raw_preview.unwrap().contains("maintenance"));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test]
async fn batch_queries_run_sequentially_with_fresh_sessions() {
    let transport = ScriptedTransport::new(vec![
        Ok(plain(200, r#"{"contract":"A"}"#)),
        Ok(plain(200, r#"{"contract":"B"}"#)),
    ]);
    let mut agent = agent_with(transport.clone(), fast_config(&["p1", "p2"]));

    let results = agent.batch_query(["PB1", "PB2"]).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|result| result.success));
    assert_eq!(results[0].contract_number, "PB1");
    assert_eq!(results[1].contract_number, "PB2");
    assert_eq!(transport.calls(), 2);
}

#[tokio::test]
async fn generated_phone_fills_missing_number() {
    let transport = ScriptedTransport::new(vec![Ok(plain(200, r#"{"ok":true}"#))]);
    let mut agent = agent_with(transport, fast_config(&["p1"]));

    let result = agent.query("PB12345678", None).await;
    assert_eq!(result.phone_number.len(), 10);
    assert!(result.phone_number.starts_with('0'));

    let transport = ScriptedTransport::new(vec![Ok(plain(200, r#"{"ok":true}"#))]);
    let mut agent = agent_with(transport, fast_config(&["p1"]));
    let result = agent.query("PB12345678", Some("0901234567")).await;
    assert_eq!(result.phone_number, "0901234567");
}
