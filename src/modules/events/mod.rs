//! Event system for the query pipeline.
//!
//! Provides hooks for logging and custom reactions around attempt
//! activity: attempts, responses, identity rotations, blocks, retries.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Structured pre-attempt event.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub contract_number: String,
    pub attempt: usize,
    pub profile_id: String,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Structured post-response event.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub contract_number: String,
    pub status: u16,
    pub decoded_len: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RotationEvent {
    pub from_profile: Option<String>,
    pub to_profile: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BlockedEvent {
    pub profile_id: String,
    pub status: u16,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub contract_number: String,
    pub attempt: usize,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Attempt(AttemptEvent),
    Response(ResponseEvent),
    Rotation(RotationEvent),
    Blocked(BlockedEvent),
    Retry(RetryEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &AgentEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: AgentEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &AgentEvent) {
        match event {
            AgentEvent::Attempt(attempt) => {
                log::debug!(
                    "-> {} attempt {} via {} proxy={:?}",
                    attempt.contract_number,
                    attempt.attempt,
                    attempt.profile_id,
                    attempt.proxy
                );
            }
            AgentEvent::Response(response) => {
                log::debug!(
                    "<- {} -> {} ({} bytes decoded)",
                    response.contract_number,
                    response.status,
                    response.decoded_len
                );
            }
            AgentEvent::Rotation(rotation) => {
                log::info!(
                    "rotation {:?} -> {} ({})",
                    rotation.from_profile,
                    rotation.to_profile,
                    rotation.reason
                );
            }
            AgentEvent::Blocked(blocked) => {
                log::warn!(
                    "profile {} blocked after status {}",
                    blocked.profile_id,
                    blocked.status
                );
            }
            AgentEvent::Retry(retry) => {
                log::info!(
                    "retry {} attempt {} after {:.2}s ({})",
                    retry.contract_number,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &AgentEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.dispatch(AgentEvent::Blocked(BlockedEvent {
            profile_id: "chrome-win-1".into(),
            status: 403,
            timestamp: Utc::now(),
        }));
        dispatcher.dispatch(AgentEvent::Response(ResponseEvent {
            contract_number: "PB12345678".into(),
            status: 200,
            decoded_len: 42,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 2);
    }
}
