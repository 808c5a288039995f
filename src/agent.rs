//! Query orchestration.
//!
//! [`BillAgent`] drives the full lookup pipeline: identity selection,
//! proxy rotation, pacing, session construction, transport, decoding, and
//! blocking recovery. A query never returns a Rust error; every outcome is
//! a [`QueryResult`] describing what happened.

use chrono::Utc;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::modules::decode::decode_body;
use crate::modules::events::{
    AgentEvent, AttemptEvent, BlockedEvent, EventDispatcher, EventHandler, LoggingHandler,
    ResponseEvent, RetryEvent, RotationEvent,
};
use crate::modules::profiles::{PoolConfig, Profile, ProfilePool, UsageSnapshot};
use crate::modules::proxy::{ProxyEndpoint, ProxyPool};
use crate::modules::rate::{DelayClass, RateConfig, RateController};
use crate::modules::session::{Session, SessionBuilder, SessionError};
use crate::transport::{BillRequest, BillTransport, RawResponse, ReqwestTransport};

const RAW_PREVIEW_LIMIT: usize = 300;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Upstream endpoint and the fixed request fields it expects.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub url: String,
    pub origin: String,
    pub referer: String,
    pub provider_code: String,
    pub sku: String,
    pub shop_address: String,
    pub shop_code: String,
    pub employee_code: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: "https://papi.fptshop.com.vn/gw/v1/public/bff-before-order/pis-online/paybill/query-partner".into(),
            origin: "https://fptshop.com.vn".into(),
            referer: "https://fptshop.com.vn/dich-vu/thanh-toan-tien-dien".into(),
            provider_code: "Payoo".into(),
            sku: "00906815".into(),
            shop_address: "string".into(),
            shop_code: "string".into(),
            employee_code: "string".into(),
        }
    }
}

/// Full agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoint: EndpointConfig,
    pub pool: PoolConfig,
    pub rate: RateConfig,
    pub proxies: Vec<ProxyEndpoint>,
    /// Empty means the built-in profile set.
    pub profiles: Vec<Profile>,
    pub max_retries: usize,
    pub request_timeout: Duration,
    /// Inclusive range of request counts after which the proxy rotates.
    pub proxy_rotate_every: (u32, u32),
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            pool: PoolConfig::default(),
            rate: RateConfig::default(),
            proxies: Vec::new(),
            profiles: Vec::new(),
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            proxy_rotate_every: (10, 20),
        }
    }
}

/// Why a query came back unsuccessful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Transport,
    Parse,
    Detection,
    Http,
    Exhausted,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one logical query, successful or not. Serializable so
/// callers can persist result batches directly.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<QueryFailure>,
    pub status: Option<u16>,
    pub contract_number: String,
    pub phone_number: String,
    pub profile_id: Option<String>,
    pub proxy: Option<String>,
    pub decoded_len: Option<usize>,
    pub attempts: usize,
    /// First bytes of an undecodable or rejected body, for diagnosis.
    pub raw_preview: Option<String>,
}

/// Fluent builder for [`BillAgent`].
#[derive(Default)]
pub struct BillAgentBuilder {
    config: AgentConfig,
    transport: Option<Arc<dyn BillTransport>>,
}

impl BillAgentBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.config.endpoint = endpoint;
        self
    }

    pub fn with_pool_config(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn with_rate_config(mut self, rate: RateConfig) -> Self {
        self.config.rate = rate;
        self
    }

    pub fn with_proxies(mut self, proxies: Vec<ProxyEndpoint>) -> Self {
        self.config.proxies = proxies;
        self
    }

    pub fn with_profiles(mut self, profiles: Vec<Profile>) -> Self {
        self.config.profiles = profiles;
        self
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.config.max_retries = max_retries.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Replace the production transport, for tests or alternative stacks.
    pub fn with_transport(mut self, transport: Arc<dyn BillTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> Result<BillAgent, AgentError> {
        let endpoint_url = Url::parse(&self.config.endpoint.url)?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new(self.config.request_timeout)));

        let profiles = if self.config.profiles.is_empty() {
            ProfilePool::new(self.config.pool.clone())
        } else {
            ProfilePool::with_profiles(self.config.pool.clone(), self.config.profiles.clone())
        };

        let mut events = EventDispatcher::new();
        events.register_handler(Arc::new(LoggingHandler));

        let (lo, hi) = self.config.proxy_rotate_every;
        let proxy_rotate_after = pick_rotate_after(lo, hi);

        Ok(BillAgent {
            endpoint_url,
            transport,
            session_builder: SessionBuilder::new(),
            profiles,
            proxies: ProxyPool::new(self.config.proxies.clone()),
            rate: RateController::new(self.config.rate.clone()),
            events,
            session: None,
            current_proxy: None,
            requests_since_proxy_rotation: 0,
            proxy_rotate_after,
            config: self.config,
        })
    }
}

fn pick_rotate_after(lo: u32, hi: u32) -> u32 {
    if hi > lo {
        rand::thread_rng().gen_range(lo..=hi)
    } else {
        lo.max(1)
    }
}

/// Generate a plausible Vietnamese mobile number for request bodies that
/// require one.
pub fn generate_phone() -> String {
    const PREFIXES: [&str; 10] = [
        "090", "091", "093", "094", "096", "097", "098", "032", "035", "038",
    ];
    let mut rng = rand::thread_rng();
    let prefix = PREFIXES.choose(&mut rng).copied().unwrap_or("090");
    let suffix: String = (0..7).map(|_| rng.gen_range(0..10u8).to_string()).collect();
    format!("{prefix}{suffix}")
}

/// Bill-lookup agent. Holds all mutable pipeline state, so queries run one
/// at a time through `&mut self`.
pub struct BillAgent {
    config: AgentConfig,
    endpoint_url: Url,
    transport: Arc<dyn BillTransport>,
    session_builder: SessionBuilder,
    profiles: ProfilePool,
    proxies: ProxyPool,
    rate: RateController,
    events: EventDispatcher,
    session: Option<Session>,
    current_proxy: Option<ProxyEndpoint>,
    requests_since_proxy_rotation: u32,
    proxy_rotate_after: u32,
}

impl BillAgent {
    pub fn builder() -> BillAgentBuilder {
        BillAgentBuilder::new()
    }

    /// Look up a single contract. Retries internally on transport errors
    /// and blocking statuses; never returns `Err`.
    pub async fn query(&mut self, contract_number: &str, phone_number: Option<&str>) -> QueryResult {
        let phone = phone_number
            .map(str::to_string)
            .unwrap_or_else(generate_phone);
        let request = BillRequest {
            url: self.endpoint_url.clone(),
            origin: self.config.endpoint.origin.clone(),
            referer: self.config.endpoint.referer.clone(),
            provider_code: self.config.endpoint.provider_code.clone(),
            contract_number: contract_number.to_string(),
            sku: self.config.endpoint.sku.clone(),
            shop_address: self.config.endpoint.shop_address.clone(),
            shop_code: self.config.endpoint.shop_code.clone(),
            employee_code: self.config.endpoint.employee_code.clone(),
        };

        let mut delay_class = DelayClass::Normal;
        let mut last_failure: Option<QueryFailure> = None;
        let mut last_status: Option<u16> = None;

        for attempt in 1..=self.config.max_retries {
            let previous_profile = self.session.as_ref().map(|s| s.profile_id.clone());
            let profile = self.profiles.select_profile(false);
            let profile_changed = previous_profile.as_deref() != Some(profile.id.as_str());

            if self.requests_since_proxy_rotation >= self.proxy_rotate_after {
                self.advance_proxy();
            }

            if profile_changed || self.session.is_none() {
                if let Some(from) = &previous_profile
                    && profile_changed
                {
                    self.events.dispatch(AgentEvent::Rotation(RotationEvent {
                        from_profile: Some(from.clone()),
                        to_profile: profile.id.clone(),
                        reason: "selection".into(),
                        timestamp: Utc::now(),
                    }));
                }
                if !self.rebuild_session(&profile) {
                    continue;
                }
            }

            self.rate.enforce_quota().await;
            let delay = self.rate.compute_delay(delay_class);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            self.rate.record_request();
            self.profiles.record_request(&profile.id);
            self.requests_since_proxy_rotation += 1;

            let Some(session) = self.session.as_mut() else {
                continue;
            };
            session.touch();
            let session = session.clone();

            self.events.dispatch(AgentEvent::Attempt(AttemptEvent {
                contract_number: contract_number.to_string(),
                attempt,
                profile_id: profile.id.clone(),
                proxy: session.proxy.as_ref().map(|proxy| proxy.url()),
                timestamp: Utc::now(),
            }));

            let response = match self.transport.clone().send(&request, &session).await {
                Ok(response) => response,
                Err(error) => {
                    log::warn!("transport failure on attempt {attempt}: {error}");
                    last_failure = Some(QueryFailure {
                        kind: ErrorKind::Transport,
                        message: error.to_string(),
                    });
                    self.events.dispatch(AgentEvent::Retry(RetryEvent {
                        contract_number: contract_number.to_string(),
                        attempt,
                        reason: error.to_string(),
                        scheduled_after: Duration::ZERO,
                        timestamp: Utc::now(),
                    }));
                    self.full_reset();
                    delay_class = DelayClass::Retry;
                    continue;
                }
            };

            last_status = Some(response.status);
            match response.status {
                200 => {
                    let decoded =
                        decode_body(&response.body, response.content_encoding.as_deref());
                    self.events.dispatch(AgentEvent::Response(ResponseEvent {
                        contract_number: contract_number.to_string(),
                        status: response.status,
                        decoded_len: decoded.len(),
                        timestamp: Utc::now(),
                    }));
                    match serde_json::from_str::<Value>(&decoded) {
                        Ok(data) => {
                            self.rate.on_success();
                            return QueryResult {
                                success: true,
                                data: Some(data),
                                error: None,
                                status: Some(200),
                                contract_number: contract_number.to_string(),
                                phone_number: phone,
                                profile_id: Some(profile.id),
                                proxy: session.proxy.as_ref().map(|proxy| proxy.url()),
                                decoded_len: Some(decoded.len()),
                                attempts: attempt,
                                raw_preview: None,
                            };
                        }
                        Err(error) => {
                            return self.failure_result(
                                ErrorKind::Parse,
                                format!("body is not valid JSON: {error}"),
                                Some(200),
                                contract_number,
                                &phone,
                                Some(&profile.id),
                                &session,
                                attempt,
                                Some(preview(&decoded)),
                            );
                        }
                    }
                }
                400 | 403 | 429 => {
                    log::warn!(
                        "detection status {} on attempt {attempt} for {contract_number}",
                        response.status
                    );
                    last_failure = Some(QueryFailure {
                        kind: ErrorKind::Detection,
                        message: format!("blocking status {}", response.status),
                    });
                    self.on_detection(&profile.id, &response);
                    delay_class = DelayClass::Error;
                    continue;
                }
                status => {
                    let decoded =
                        decode_body(&response.body, response.content_encoding.as_deref());
                    return self.failure_result(
                        ErrorKind::Http,
                        format!("unexpected status {status}"),
                        Some(status),
                        contract_number,
                        &phone,
                        Some(&profile.id),
                        &session,
                        attempt,
                        Some(preview(&decoded)),
                    );
                }
            }
        }

        let message = match &last_failure {
            Some(failure) => format!(
                "gave up after {} attempts, last error: {}",
                self.config.max_retries, failure.message
            ),
            None => format!("gave up after {} attempts", self.config.max_retries),
        };
        QueryResult {
            success: false,
            data: None,
            error: Some(QueryFailure {
                kind: ErrorKind::Exhausted,
                message,
            }),
            status: last_status,
            contract_number: contract_number.to_string(),
            phone_number: phone,
            profile_id: self.profiles.current_id().map(str::to_string),
            proxy: self.current_proxy.as_ref().map(|proxy| proxy.url()),
            decoded_len: None,
            attempts: self.config.max_retries,
            raw_preview: None,
        }
    }

    /// Look up a batch of contracts sequentially. Each item starts from a
    /// fresh session.
    pub async fn batch_query<I>(&mut self, contract_numbers: I) -> Vec<QueryResult>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut results = Vec::new();
        for contract in contract_numbers {
            self.session = None;
            results.push(self.query(contract.as_ref(), None).await);
        }
        results
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        self.profiles.usage_snapshot()
    }

    pub fn register_event_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.events.register_handler(handler);
    }

    /// React to a blocking status: block bookkeeping, slow down, burn the
    /// proxy, and start over with a fresh identity.
    fn on_detection(&mut self, profile_id: &str, response: &RawResponse) {
        if self.profiles.record_error(profile_id, "detection") {
            self.events.dispatch(AgentEvent::Blocked(BlockedEvent {
                profile_id: profile_id.to_string(),
                status: response.status,
                timestamp: Utc::now(),
            }));
        }
        self.rate.on_blocking();
        if let Some(proxy) = self.current_proxy.clone() {
            self.proxies.mark_failed(&proxy);
        }
        self.advance_proxy();
        let profile = self.profiles.select_profile(true);
        self.rebuild_session(&profile);
    }

    /// Full identity reset after a transport failure. The profile is not
    /// penalized; transport errors say nothing about detection.
    fn full_reset(&mut self) {
        self.advance_proxy();
        let profile = self.profiles.select_profile(true);
        self.rebuild_session(&profile);
    }

    fn advance_proxy(&mut self) {
        if self.proxies.is_empty() {
            self.current_proxy = None;
            return;
        }
        self.current_proxy = self.proxies.next_proxy();
        self.requests_since_proxy_rotation = 0;
        let (lo, hi) = self.config.proxy_rotate_every;
        self.proxy_rotate_after = pick_rotate_after(lo, hi);
    }

    fn rebuild_session(&mut self, profile: &Profile) -> bool {
        if self.current_proxy.is_none() && !self.proxies.is_empty() {
            self.advance_proxy();
        }
        match self
            .session_builder
            .build(profile, self.current_proxy.clone())
        {
            Ok(session) => {
                self.session = Some(session);
                true
            }
            Err(error) => {
                log::error!("session build failed for {}: {error}", profile.id);
                self.session = None;
                false
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn failure_result(
        &self,
        kind: ErrorKind,
        message: String,
        status: Option<u16>,
        contract_number: &str,
        phone: &str,
        profile_id: Option<&str>,
        session: &Session,
        attempts: usize,
        raw_preview: Option<String>,
    ) -> QueryResult {
        QueryResult {
            success: false,
            data: None,
            error: Some(QueryFailure { kind, message }),
            status,
            contract_number: contract_number.to_string(),
            phone_number: phone.to_string(),
            profile_id: profile_id.map(str::to_string),
            proxy: session.proxy.as_ref().map(|proxy| proxy.url()),
            decoded_len: None,
            attempts,
            raw_preview,
        }
    }
}

fn preview(decoded: &str) -> String {
    let mut end = decoded.len().min(RAW_PREVIEW_LIMIT);
    while end > 0 && !decoded.is_char_boundary(end) {
        end -= 1;
    }
    decoded[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_phone_has_valid_shape() {
        for _ in 0..50 {
            let phone = generate_phone();
            assert_eq!(phone.len(), 10);
            assert!(phone.starts_with('0'));
            assert!(phone.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let text = "é".repeat(400);
        let cut = preview(&text);
        assert!(cut.len() <= RAW_PREVIEW_LIMIT);
        assert!(text.starts_with(&cut));
    }

    #[test]
    fn builder_rejects_bad_endpoint_url() {
        let result = BillAgent::builder()
            .with_endpoint(EndpointConfig {
                url: "not a url".into(),
                ..Default::default()
            })
            .build();
        assert!(matches!(result, Err(AgentError::Url(_))));
    }

    #[test]
    fn default_endpoint_parses() {
        assert!(Url::parse(&EndpointConfig::default().url).is_ok());
    }
}
