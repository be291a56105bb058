//! Deploy context, cancellation and progress reporting
//!
//! Account and region are passed explicitly; nothing reads ambient globals.

use crate::resource::ResourceId;
use crate::types::ResourceChange;
use crate::value::ContextKey;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Deploy-wide values referenced through [`Value::Context`](crate::Value::Context)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployContext {
    pub stack_name: String,
    pub environment: String,
    pub region: String,
    pub account: String,
}

impl Default for DeployContext {
    fn default() -> Self {
        Self {
            stack_name: "PrivateApiStack".to_string(),
            environment: "Production".to_string(),
            region: "us-east-1".to_string(),
            account: "000000000000".to_string(),
        }
    }
}

impl DeployContext {
    pub fn value(&self, key: ContextKey) -> &str {
        match key {
            ContextKey::Region => &self.region,
            ContextKey::Account => &self.account,
            ContextKey::Environment => &self.environment,
            ContextKey::StackName => &self.stack_name,
        }
    }
}

/// Cooperative cancellation signal shared between the caller and workers
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

const SLEEP_SLICE: Duration = Duration::from_millis(50);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation
    ///
    /// Returns `false` if cancelled before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep((until - now).min(SLEEP_SLICE));
        }
    }
}

/// Progress callback for apply and destroy
///
/// Called from worker threads, so implementations must be thread-safe.
pub trait ProgressCallback: Send + Sync {
    fn on_stage_start(&self, stage: usize, total: usize, count: usize);

    fn on_resource_start(&self, id: &ResourceId, description: &str);

    fn on_resource_complete(&self, id: &ResourceId, change: &ResourceChange);

    fn on_stage_complete(&self, stage: usize);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_stage_start(&self, _stage: usize, _total: usize, _count: usize) {}
    fn on_resource_start(&self, _id: &ResourceId, _description: &str) {}
    fn on_resource_complete(&self, _id: &ResourceId, _change: &ResourceChange) {}
    fn on_stage_complete(&self, _stage: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_values() {
        let ctx = DeployContext::default();
        assert_eq!(ctx.value(ContextKey::Environment), "Production");
        assert_eq!(ctx.value(ContextKey::Region), "us-east-1");
    }

    #[test]
    fn test_cancelled_sleep_returns_early() {
        let token = CancelToken::new();
        let other = token.clone();
        other.cancel();

        let start = Instant::now();
        assert!(!token.sleep(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_uncancelled_sleep_completes() {
        assert!(CancelToken::new().sleep(Duration::from_millis(5)));
    }
}
