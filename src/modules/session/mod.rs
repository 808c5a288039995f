//! Session construction.
//!
//! A [`Session`] packages everything one outbound identity needs: the full
//! header set derived from a profile, a randomized cookie jar that looks
//! like a browsing session in progress, and an optional proxy binding.
//! Headers are deterministic per profile; cookies are fresh on every build.

use chrono::{DateTime, Utc};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

use crate::modules::profiles::Profile;
use crate::modules::proxy::ProxyEndpoint;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid header value: {0}")]
    InvalidHeader(String),
}

/// A built outbound identity, bound to one profile and at most one proxy.
#[derive(Debug, Clone)]
pub struct Session {
    pub profile_id: String,
    pub headers: HeaderMap,
    pub cookies: HashMap<String, String>,
    pub proxy: Option<ProxyEndpoint>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Render the cookie jar as a `Cookie` header value. Keys are sorted so
    /// the output is stable for a given jar.
    pub fn cookie_header(&self) -> String {
        let mut pairs: Vec<_> = self.cookies.iter().collect();
        pairs.sort_by_key(|(key, _)| key.as_str());
        pairs
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Advance the session's activity cookies, as a browser tab would
    /// between page interactions.
    pub fn touch(&mut self) {
        self.cookies
            .insert("last_activity".into(), Utc::now().timestamp().to_string());
        let views = self
            .cookies
            .get("page_views")
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0);
        self.cookies
            .insert("page_views".into(), (views + 1).to_string());
    }
}

/// Builds sessions from profiles. Stateless; kept as a struct so callers
/// hold one place to hang future configuration off.
#[derive(Debug, Default)]
pub struct SessionBuilder;

impl SessionBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        profile: &Profile,
        proxy: Option<ProxyEndpoint>,
    ) -> Result<Session, SessionError> {
        Ok(Session {
            profile_id: profile.id.clone(),
            headers: build_headers(profile)?,
            cookies: seed_cookies(profile),
            proxy,
            created_at: Utc::now(),
        })
    }
}

fn header_value(raw: &str) -> Result<HeaderValue, SessionError> {
    HeaderValue::from_str(raw).map_err(|_| SessionError::InvalidHeader(raw.to_string()))
}

fn build_headers(profile: &Profile) -> Result<HeaderMap, SessionError> {
    let mut headers = HeaderMap::new();
    let mut insert = |name: &'static str, value: &str| -> Result<(), SessionError> {
        headers.insert(
            HeaderName::from_static(name),
            header_value(value)?,
        );
        Ok(())
    };

    insert("user-agent", &profile.user_agent)?;
    insert("accept", "application/json, text/plain, */*")?;
    insert("accept-language", &profile.language)?;
    insert("accept-encoding", "gzip, deflate, br")?;
    insert("connection", "keep-alive")?;
    insert("cache-control", "no-cache")?;
    insert("pragma", "no-cache")?;
    insert("sec-fetch-dest", "empty")?;
    insert("sec-fetch-mode", "cors")?;
    insert("sec-fetch-site", "same-site")?;

    if profile.browser.is_chromium() {
        let major = profile
            .browser_version
            .split('.')
            .next()
            .unwrap_or("120");
        let brand = match profile.browser {
            crate::modules::profiles::BrowserFamily::Edge => format!(
                "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major}\", \"Microsoft Edge\";v=\"{major}\""
            ),
            _ => format!(
                "\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major}\", \"Google Chrome\";v=\"{major}\""
            ),
        };
        insert("sec-ch-ua", &brand)?;
        insert("sec-ch-ua-mobile", "?0")?;
        let platform = match profile.platform.as_str() {
            "Win32" => "\"Windows\"",
            "MacIntel" => "\"macOS\"",
            _ => "\"Linux\"",
        };
        insert("sec-ch-ua-platform", platform)?;
    }

    Ok(headers)
}

fn hex_digest(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// JavaScript `getTimezoneOffset()` convention: minutes behind UTC, so
/// zones east of UTC are negative.
fn timezone_offset_minutes(timezone: &str) -> i32 {
    match timezone {
        "Asia/Ho_Chi_Minh" | "Asia/Bangkok" | "Asia/Jakarta" => -420,
        "Asia/Tokyo" => -540,
        "Asia/Singapore" | "Asia/Manila" => -480,
        _ => -420,
    }
}

fn seed_cookies(profile: &Profile) -> HashMap<String, String> {
    let mut rng = rand::thread_rng();
    let now = Utc::now().timestamp();
    let session_id = Uuid::new_v4().simple().to_string();
    let visitor_id = hex_digest(&format!("{session_id}{now}"))[..16].to_string();
    let site_token = hex_digest(&format!("{now}{session_id}"))[..32].to_string();

    let mut cookies = HashMap::new();
    cookies.insert("session_id".into(), session_id);
    cookies.insert("device_id".into(), Uuid::new_v4().to_string());
    cookies.insert("visitor_id".into(), visitor_id);
    cookies.insert("site_session_token".into(), site_token);
    cookies.insert(
        "_ga".into(),
        format!("GA1.2.{}.{now}", rng.gen_range(100_000_000u32..1_000_000_000)),
    );
    cookies.insert(
        "_gid".into(),
        format!("GA1.2.{}.{now}", rng.gen_range(100_000_000u32..1_000_000_000)),
    );
    cookies.insert("_gat".into(), "1".into());
    cookies.insert("cart_id".into(), Uuid::new_v4().to_string());
    cookies.insert(
        "screen_resolution".into(),
        format!("{}x{}", profile.screen.0, profile.screen.1),
    );
    cookies.insert(
        "timezone_offset".into(),
        timezone_offset_minutes(&profile.timezone).to_string(),
    );
    cookies.insert(
        "first_visit".into(),
        (now - rng.gen_range(3600i64..86_400 * 30)).to_string(),
    );
    cookies.insert("last_activity".into(), now.to_string());
    cookies.insert("page_views".into(), rng.gen_range(1u32..=5).to_string());
    cookies
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::profiles::{BrowserFamily, Profile};

    fn profile(browser: BrowserFamily, platform: &str) -> Profile {
        Profile {
            id: "test".into(),
            name: "test".into(),
            browser,
            browser_version: "120.0.6099.129".into(),
            user_agent: "Mozilla/5.0 test".into(),
            platform: platform.into(),
            screen: (1920, 1080),
            language: "vi-VN,vi;q=0.9".into(),
            timezone: "Asia/Ho_Chi_Minh".into(),
            fingerprint_token: "fp-test".into(),
        }
    }

    #[test]
    fn headers_are_deterministic_per_profile() {
        let builder = SessionBuilder::new();
        let profile = profile(BrowserFamily::Chrome, "Win32");
        let first = builder.build(&profile, None).unwrap();
        let second = builder.build(&profile, None).unwrap();
        assert_eq!(first.headers, second.headers);
    }

    #[test]
    fn chromium_profiles_carry_client_hints() {
        let builder = SessionBuilder::new();
        let chrome = builder
            .build(&profile(BrowserFamily::Chrome, "Win32"), None)
            .unwrap();
        assert!(chrome.headers.contains_key("sec-ch-ua"));
        assert_eq!(
            chrome.headers.get("sec-ch-ua-platform").unwrap(),
            "\"Windows\""
        );
        assert!(
            chrome
                .headers
                .get("sec-ch-ua")
                .unwrap()
                .to_str()
                .unwrap()
                .contains("Google Chrome")
        );

        let edge = builder
            .build(&profile(BrowserFamily::Edge, "MacIntel"), None)
            .unwrap();
        assert!(
            edge.headers
                .get("sec-ch-ua")
                .unwrap()
                .to_str()
                .unwrap()
                .contains("Microsoft Edge")
        );
        assert_eq!(
            edge.headers.get("sec-ch-ua-platform").unwrap(),
            "\"macOS\""
        );

        let firefox = builder
            .build(&profile(BrowserFamily::Firefox, "Win32"), None)
            .unwrap();
        assert!(!firefox.headers.contains_key("sec-ch-ua"));
    }

    #[test]
    fn cookies_differ_between_builds() {
        let builder = SessionBuilder::new();
        let profile = profile(BrowserFamily::Chrome, "Win32");
        let first = builder.build(&profile, None).unwrap();
        let second = builder.build(&profile, None).unwrap();
        assert_ne!(first.cookies["session_id"], second.cookies["session_id"]);
        assert_ne!(first.cookies["device_id"], second.cookies["device_id"]);
        assert_eq!(first.cookies["screen_resolution"], "1920x1080");
        assert_eq!(first.cookies["timezone_offset"], "-420");
    }

    #[test]
    fn cookie_header_is_sorted_and_joined() {
        let mut session = SessionBuilder::new()
            .build(&profile(BrowserFamily::Chrome, "Win32"), None)
            .unwrap();
        session.cookies.clear();
        session.cookies.insert("b".into(), "2".into());
        session.cookies.insert("a".into(), "1".into());
        assert_eq!(session.cookie_header(), "a=1; b=2");
    }

    #[test]
    fn touch_advances_activity() {
        let mut session = SessionBuilder::new()
            .build(&profile(BrowserFamily::Chrome, "Win32"), None)
            .unwrap();
        let views: u32 = session.cookies["page_views"].parse().unwrap();
        session.touch();
        let after: u32 = session.cookies["page_views"].parse().unwrap();
        assert_eq!(after, views + 1);
    }
}
