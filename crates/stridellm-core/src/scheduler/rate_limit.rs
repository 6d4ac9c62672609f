//! Per-tenant sliding-window token budget.

use crate::config::RateLimitConfig;
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Bucket used for submissions without a tenant
pub const DEFAULT_TENANT: &str = "default";

/// Sliding-window rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    window: Duration,
    max_tokens: usize,
    /// Charges per tenant, oldest first
    charges: HashMap<String, VecDeque<(Instant, usize)>>,
    /// Last time every tenant was pruned
    last_sweep: Option<Instant>,
}

impl RateLimiter {
    /// Create a limiter
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            window: config.window(),
            max_tokens: config.max_tokens_per_window,
            charges: HashMap::new(),
            last_sweep: None,
        }
    }

    /// Drop expired charges of every tenant, at most once per window
    fn sweep(&mut self, now: Instant) {
        if self
            .last_sweep
            .is_some_and(|at| now.saturating_duration_since(at) < self.window)
        {
            return;
        }
        let window = self.window;
        let before = self.charges.len();
        self.charges.retain(|_, charges| {
            charges.retain(|(at, _)| now.saturating_duration_since(*at) < window);
            !charges.is_empty()
        });
        if self.charges.len() < before {
            tracing::trace!("Dropped {} idle tenants", before - self.charges.len());
        }
        self.last_sweep = Some(now);
    }

    fn prune(&mut self, tenant: &str, now: Instant) {
        let window = self.window;
        if let Some(charges) = self.charges.get_mut(tenant) {
            while charges
                .front()
                .is_some_and(|(at, _)| now.saturating_duration_since(*at) >= window)
            {
                charges.pop_front();
            }
            if charges.is_empty() {
                self.charges.remove(tenant);
            }
        }
    }

    fn used(&self, tenant: &str) -> usize {
        self.charges
            .get(tenant)
            .map_or(0, |c| c.iter().map(|(_, n)| n).sum())
    }

    /// Tokens a tenant may still spend in the current window
    pub fn remaining(&mut self, tenant: Option<&str>, now: Instant) -> usize {
        let tenant = tenant.unwrap_or(DEFAULT_TENANT);
        self.sweep(now);
        self.prune(tenant, now);
        self.max_tokens.saturating_sub(self.used(tenant))
    }

    /// Charge `tokens` to a tenant, or fail without charging
    pub fn charge(&mut self, tenant: Option<&str>, tokens: usize, now: Instant) -> Result<()> {
        let remaining = self.remaining(tenant, now);
        let tenant = tenant.unwrap_or(DEFAULT_TENANT);
        if tokens > remaining {
            return Err(Error::RateLimitExceeded {
                tenant: tenant.to_string(),
                requested: tokens,
                remaining,
            });
        }
        self.charges
            .entry(tenant.to_string())
            .or_default()
            .push_back((now, tokens));
        Ok(())
    }

    /// Number of tenants with charges still tracked
    pub fn tracked_tenants(&self) -> usize {
        self.charges.len()
    }
}
