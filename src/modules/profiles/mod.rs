//! Synthetic browser identity pool.
//!
//! Owns the set of profiles the agent rotates through, together with
//! per-profile usage bookkeeping (request counts, error counts, temporary
//! blocks). Selection always prefers the least-used available profile and
//! falls back to a built-in identity when the whole pool is exhausted.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| {
        let millis = duration.as_millis().min(i64::MAX as u128);
        chrono::Duration::milliseconds(millis as i64)
    })
}

/// Browser family a profile imitates. Chromium-based families carry the
/// extra low-entropy client-hint headers when a session is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserFamily {
    Chrome,
    Edge,
    Firefox,
}

impl BrowserFamily {
    pub fn is_chromium(self) -> bool {
        matches!(self, BrowserFamily::Chrome | BrowserFamily::Edge)
    }

    pub fn name(self) -> &'static str {
        match self {
            BrowserFamily::Chrome => "Chrome",
            BrowserFamily::Edge => "Edge",
            BrowserFamily::Firefox => "Firefox",
        }
    }
}

/// A synthetic browser identity. Immutable once loaded; all mutable
/// bookkeeping lives in [`ProfileUsage`].
#[derive(Debug, Clone)]
pub struct Profile {
    pub id: String,
    pub name: String,
    pub browser: BrowserFamily,
    pub browser_version: String,
    pub user_agent: String,
    pub platform: String,
    pub screen: (u16, u16),
    pub language: String,
    pub timezone: String,
    /// Stable pseudo-random token assigned when the pool is loaded.
    pub fingerprint_token: String,
}

/// Mutable per-profile counters, one record per profile id.
#[derive(Debug, Clone, Default)]
pub struct ProfileUsage {
    pub requests_count: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub errors_count: u32,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Knobs for selection, rotation, and blocking.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-profile request ceiling before the cooldown applies.
    pub max_requests_per_profile: u32,
    /// How long a profile rests once the ceiling is hit before its counter
    /// resets.
    pub cooldown: Duration,
    /// Elapsed time since the last rotation that forces a new selection.
    pub rotate_interval: Duration,
    /// Errors before a profile is temporarily blocked.
    pub error_threshold: u32,
    /// How long a blocked profile stays out of rotation.
    pub block_duration: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_requests_per_profile: 50,
            cooldown: Duration::from_secs(60 * 60),
            rotate_interval: Duration::from_secs(30 * 60),
            error_threshold: 3,
            block_duration: Duration::from_secs(30 * 60),
        }
    }
}

/// Per-profile view exposed through [`UsageSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ProfileUsageView {
    pub name: String,
    pub requests_count: u32,
    pub errors_count: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub is_available: bool,
}

/// Snapshot of pool state for observability.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub total_profiles: usize,
    pub available_profiles: usize,
    pub current_profile_id: Option<String>,
    pub per_profile: HashMap<String, ProfileUsageView>,
}

/// Identity pool with least-used selection and temporary blocking.
#[derive(Debug)]
pub struct ProfilePool {
    profiles: Vec<Profile>,
    usage: HashMap<String, ProfileUsage>,
    current: Option<String>,
    last_rotation: Option<DateTime<Utc>>,
    config: PoolConfig,
}

impl ProfilePool {
    /// Pool backed by the built-in profile set.
    pub fn new(config: PoolConfig) -> Self {
        Self::with_profiles(config, BUILTIN_PROFILES.clone())
    }

    pub fn with_profiles(config: PoolConfig, profiles: Vec<Profile>) -> Self {
        let usage = profiles
            .iter()
            .map(|profile| (profile.id.clone(), ProfileUsage::default()))
            .collect();
        Self {
            profiles,
            usage,
            current: None,
            last_rotation: None,
            config,
        }
    }

    /// Select a profile for the next request. `force_new` skips the
    /// stickiness of the current selection, as after an error.
    pub fn select_profile(&mut self, force_new: bool) -> Profile {
        let now = Utc::now();
        let available = self.available_ids(now);

        if available.is_empty() {
            log::warn!("no available profiles, using fallback identity");
            let fallback = fallback_profile();
            self.current = Some(fallback.id.clone());
            self.last_rotation = Some(now);
            return fallback;
        }

        // A blocked or spent current profile never survives a selection.
        let current_available = self
            .current
            .as_ref()
            .map(|id| available.contains(id))
            .unwrap_or(false);

        if force_new || !current_available {
            let id = self.least_used(&available);
            if self.current.as_deref() != Some(id.as_str()) {
                log::info!("selected profile {id}");
            }
            self.current = Some(id);
            self.last_rotation = Some(now);
        } else if self.should_rotate(now) {
            let current = self.current.clone();
            let others: Vec<String> = available
                .iter()
                .filter(|id| Some(id.as_str()) != current.as_deref())
                .cloned()
                .collect();
            if !others.is_empty() {
                let id = self.least_used(&others);
                log::info!("rotated profile {:?} -> {id}", current);
                self.current = Some(id);
                self.last_rotation = Some(now);
            }
        }

        self.current_profile()
    }

    /// Whether a rotation trigger fired: elapsed interval, or the current
    /// profile reached 80% of its request ceiling.
    pub fn should_rotate(&self, now: DateTime<Utc>) -> bool {
        let (Some(current), Some(last_rotation)) = (&self.current, self.last_rotation) else {
            return true;
        };

        if now - last_rotation > chrono_duration(self.config.rotate_interval) {
            return true;
        }

        let used = self
            .usage
            .get(current)
            .map(|usage| usage.requests_count)
            .unwrap_or(0);
        used as f64 >= self.config.max_requests_per_profile as f64 * 0.8
    }

    pub fn record_request(&mut self, profile_id: &str) {
        let usage = self.usage.entry(profile_id.to_string()).or_default();
        usage.requests_count += 1;
        usage.last_used = Some(Utc::now());
    }

    /// Record an error against a profile. Returns `true` when the error
    /// pushed the profile over the threshold and it is now blocked; the
    /// caller is still expected to force a fresh selection explicitly.
    pub fn record_error(&mut self, profile_id: &str, kind: &str) -> bool {
        let threshold = self.config.error_threshold;
        let block = chrono_duration(self.config.block_duration);
        let usage = self.usage.entry(profile_id.to_string()).or_default();
        usage.errors_count += 1;

        if usage.errors_count >= threshold && usage.blocked_until.is_none() {
            usage.blocked_until = Some(Utc::now() + block);
            log::warn!(
                "profile {profile_id} blocked after {} {kind} errors",
                usage.errors_count
            );
            return true;
        }
        false
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn usage_snapshot(&self) -> UsageSnapshot {
        let now = Utc::now();
        let mut per_profile = HashMap::new();
        let mut available = 0;

        for profile in &self.profiles {
            let usage = self.usage.get(&profile.id).cloned().unwrap_or_default();
            let is_available = self.is_available(&usage, now);
            if is_available {
                available += 1;
            }
            per_profile.insert(
                profile.id.clone(),
                ProfileUsageView {
                    name: profile.name.clone(),
                    requests_count: usage.requests_count,
                    errors_count: usage.errors_count,
                    last_used: usage.last_used,
                    blocked_until: usage.blocked_until,
                    is_available,
                },
            );
        }

        UsageSnapshot {
            total_profiles: self.profiles.len(),
            available_profiles: available,
            current_profile_id: self.current.clone(),
            per_profile,
        }
    }

    /// Reset the counters of one profile, or the whole pool.
    pub fn reset_usage(&mut self, profile_id: Option<&str>) {
        match profile_id {
            Some(id) => {
                if let Some(usage) = self.usage.get_mut(id) {
                    *usage = ProfileUsage::default();
                }
            }
            None => {
                for usage in self.usage.values_mut() {
                    *usage = ProfileUsage::default();
                }
            }
        }
    }

    /// Non-mutating availability predicate, used for snapshots.
    fn is_available(&self, usage: &ProfileUsage, now: DateTime<Utc>) -> bool {
        if let Some(until) = usage.blocked_until
            && now < until
        {
            return false;
        }

        if usage.requests_count >= self.config.max_requests_per_profile
            && let Some(last_used) = usage.last_used
            && now - last_used < chrono_duration(self.config.cooldown)
        {
            return false;
        }

        true
    }

    /// Ids eligible for selection, applying the block-expiry and
    /// cooldown-expiry counter resets as a side effect.
    fn available_ids(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let cooldown = chrono_duration(self.config.cooldown);
        let ceiling = self.config.max_requests_per_profile;
        let mut available = Vec::new();

        for profile in &self.profiles {
            let usage = self.usage.entry(profile.id.clone()).or_default();

            if let Some(until) = usage.blocked_until {
                if now < until {
                    continue;
                }
                // Block expired: the profile re-enters rotation clean.
                usage.blocked_until = None;
                usage.requests_count = 0;
                usage.errors_count = 0;
            }

            if usage.requests_count >= ceiling {
                match usage.last_used {
                    Some(last_used) if now - last_used < cooldown => continue,
                    _ => usage.requests_count = 0,
                }
            }

            available.push(profile.id.clone());
        }

        available
    }

    /// Least-used id; ties broken by id order so selection is deterministic.
    fn least_used(&self, ids: &[String]) -> String {
        ids.iter()
            .min_by_key(|id| {
                let count = self
                    .usage
                    .get(id.as_str())
                    .map(|usage| usage.requests_count)
                    .unwrap_or(0);
                (count, id.as_str())
            })
            .cloned()
            .unwrap_or_else(|| fallback_profile().id)
    }

    fn current_profile(&self) -> Profile {
        self.current
            .as_deref()
            .and_then(|id| self.profiles.iter().find(|profile| profile.id == id))
            .cloned()
            .unwrap_or_else(fallback_profile)
    }
}

/// Built-in identity used when every pooled profile is blocked or spent.
pub fn fallback_profile() -> Profile {
    Profile {
        id: "fallback".into(),
        name: "Fallback Chrome".into(),
        browser: BrowserFamily::Chrome,
        browser_version: "120.0.6099.109".into(),
        user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
        platform: "Win32".into(),
        screen: (1920, 1080),
        language: "vi-VN,vi;q=0.9,en;q=0.8".into(),
        timezone: "Asia/Ho_Chi_Minh".into(),
        fingerprint_token: "fp-fallback".into(),
    }
}

/// Default profile set. Fingerprint tokens are drawn once per process so a
/// profile's fingerprint stays stable across sessions.
static BUILTIN_PROFILES: Lazy<Vec<Profile>> = Lazy::new(|| {
    let mut rng = rand::thread_rng();
    let mut token = || format!("fp-{:016x}", rng.gen_range(0u64..u64::MAX));

    vec![
        Profile {
            id: "chrome-win-1".into(),
            name: "Chrome on Windows".into(),
            browser: BrowserFamily::Chrome,
            browser_version: "120.0.6099.129".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
            platform: "Win32".into(),
            screen: (1920, 1080),
            language: "vi-VN,vi;q=0.9,en;q=0.8,en-US;q=0.7".into(),
            timezone: "Asia/Ho_Chi_Minh".into(),
            fingerprint_token: token(),
        },
        Profile {
            id: "chrome-mac-1".into(),
            name: "Chrome on macOS".into(),
            browser: BrowserFamily::Chrome,
            browser_version: "120.0.6099.110".into(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
            platform: "MacIntel".into(),
            screen: (2560, 1440),
            language: "vi-VN,vi;q=0.9,en;q=0.8".into(),
            timezone: "Asia/Ho_Chi_Minh".into(),
            fingerprint_token: token(),
        },
        Profile {
            id: "chrome-win-2".into(),
            name: "Chrome on Windows (laptop)".into(),
            browser: BrowserFamily::Chrome,
            browser_version: "120.0.6099.71".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".into(),
            platform: "Win32".into(),
            screen: (1366, 768),
            language: "vi-VN,vi;q=0.9,en;q=0.8".into(),
            timezone: "Asia/Bangkok".into(),
            fingerprint_token: token(),
        },
        Profile {
            id: "edge-win-1".into(),
            name: "Edge on Windows".into(),
            browser: BrowserFamily::Edge,
            browser_version: "120.0.2210.91".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91".into(),
            platform: "Win32".into(),
            screen: (1536, 864),
            language: "vi-VN,vi;q=0.9,en;q=0.8".into(),
            timezone: "Asia/Ho_Chi_Minh".into(),
            fingerprint_token: token(),
        },
        Profile {
            id: "firefox-win-1".into(),
            name: "Firefox on Windows".into(),
            browser: BrowserFamily::Firefox,
            browser_version: "121.0".into(),
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0".into(),
            platform: "Win32".into(),
            screen: (1920, 1080),
            language: "vi-VN,vi;q=0.9,en;q=0.8".into(),
            timezone: "Asia/Ho_Chi_Minh".into(),
            fingerprint_token: token(),
        },
        Profile {
            id: "firefox-mac-1".into(),
            name: "Firefox on macOS".into(),
            browser: BrowserFamily::Firefox,
            browser_version: "121.0".into(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0".into(),
            platform: "MacIntel".into(),
            screen: (1440, 900),
            language: "vi-VN,vi;q=0.9,en;q=0.8".into(),
            timezone: "Asia/Jakarta".into(),
            fingerprint_token: token(),
        },
    ]
});
