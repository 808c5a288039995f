//! HTTP transport.
//!
//! Defines the wire request/response types and the [`BillTransport`] trait
//! the agent drives, plus the production [`ReqwestTransport`]. Clients are
//! pooled per proxy URL because a `reqwest::Client` binds its proxy at
//! construction time.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::modules::session::Session;

/// One outbound bill-lookup request, fully resolved.
#[derive(Debug, Clone)]
pub struct BillRequest {
    pub url: Url,
    pub origin: String,
    pub referer: String,
    pub provider_code: String,
    pub contract_number: String,
    pub sku: String,
    pub shop_address: String,
    pub shop_code: String,
    pub employee_code: String,
}

impl BillRequest {
    /// JSON body in the upstream API's wire shape.
    pub fn body(&self) -> serde_json::Value {
        serde_json::json!({
            "providerCode": self.provider_code,
            "contractNumber": self.contract_number,
            "sku": self.sku,
            "shopAddress": self.shop_address,
            "shopCode": self.shop_code,
            "employeeCode": self.employee_code,
        })
    }
}

/// Raw response as received: status plus undecoded body bytes and the
/// headers the decoder needs.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_encoding: Option<String>,
    pub content_type: Option<String>,
    pub body: Bytes,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("proxy configuration rejected: {0}")]
    Proxy(String),
    #[error("invalid header value: {0}")]
    InvalidHeader(String),
}

/// Sends a prepared request under a session's identity.
#[async_trait]
pub trait BillTransport: Send + Sync {
    async fn send(
        &self,
        request: &BillRequest,
        session: &Session,
    ) -> Result<RawResponse, TransportError>;
}

/// Production transport backed by `reqwest`, one client per proxy URL.
pub struct ReqwestTransport {
    timeout: Duration,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client_for(&self, proxy_url: Option<&str>) -> Result<reqwest::Client, TransportError> {
        let key = proxy_url.map(str::to_string);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(Duration::from_secs(10));
        if let Some(url) = proxy_url {
            let proxy = reqwest::Proxy::all(url)
                .map_err(|error| TransportError::Proxy(error.to_string()))?;
            builder = builder.proxy(proxy);
        }
        let client = builder
            .build()
            .map_err(|error| TransportError::Connect(error.to_string()))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl BillTransport for ReqwestTransport {
    async fn send(
        &self,
        request: &BillRequest,
        session: &Session,
    ) -> Result<RawResponse, TransportError> {
        let proxy_url = session.proxy.as_ref().map(|proxy| proxy.url());
        let client = self.client_for(proxy_url.as_deref()).await?;

        let mut headers = session.headers.clone();
        let mut set = |name: &'static str, value: &str| -> Result<(), TransportError> {
            headers.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(value)
                    .map_err(|_| TransportError::InvalidHeader(value.to_string()))?,
            );
            Ok(())
        };
        set("origin", &request.origin)?;
        set("referer", &request.referer)?;
        set("order-channel", "1")?;
        set("x-requested-with", "XMLHttpRequest")?;
        set("cookie", &session.cookie_header())?;

        let response = client
            .post(request.url.clone())
            .headers(headers)
            .json(&request.body())
            .send()
            .await
            .map_err(|error| {
                if error.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Connect(error.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let header_string = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let content_encoding = header_string("content-encoding");
        let content_type = header_string("content-type");

        let body = response
            .bytes()
            .await
            .map_err(|error| TransportError::Connect(error.to_string()))?;

        Ok(RawResponse {
            status,
            content_encoding,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> BillRequest {
        BillRequest {
            url: Url::parse("https://api.example.com/paybill/query-partner").unwrap(),
            origin: "https://example.com".into(),
            referer: "https://example.com/pay".into(),
            provider_code: "Payoo".into(),
            contract_number: "PB12345678".into(),
            sku: "00906815".into(),
            shop_address: "string".into(),
            shop_code: "string".into(),
            employee_code: "string".into(),
        }
    }

    #[test]
    fn body_uses_wire_field_names() {
        let body = request().body();
        assert_eq!(body["providerCode"], "Payoo");
        assert_eq!(body["contractNumber"], "PB12345678");
        assert_eq!(body["sku"], "00906815");
        assert_eq!(body["shopCode"], "string");
        assert_eq!(body["employeeCode"], "string");
    }
}
