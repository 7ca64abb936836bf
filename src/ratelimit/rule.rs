//! Rate limiting rules: a rate applied to keys derived from a request context.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, trace};

use super::provider::SlidingWindowProvider;
use super::rate::Rate;
use super::slot_provider::{MemorySlotProvider, SlotProvider};
use super::window::{unix_now, Decision};
use crate::error::{LimiterError, Result};

type KeyFn<C> = dyn Fn(&C) -> Option<String> + Send + Sync;
type OnLimitFn<C> = dyn Fn(&C, &Limited) -> Result<()> + Send + Sync;

/// Details passed to a rule's limit handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Limited {
    /// Name of the rule
    pub rule: String,
    /// Logical key that is over budget
    pub key: String,
    /// Unix time (seconds) up to which the key is predicted to stay blocked
    pub until: f64,
}

impl From<Limited> for LimiterError {
    fn from(limited: Limited) -> Self {
        LimiterError::RateLimited {
            rule: limited.rule,
            key: limited.key,
            until: limited.until,
        }
    }
}

/// Result of applying a rule to one request.
#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    /// The key function returned no key; the request is not limited.
    Skipped,
    /// The request was checked against the window for `key`.
    Checked {
        /// Logical key the request was counted under
        key: String,
        /// The window's decision
        decision: Decision,
    },
}

/// A rate applied per logical key extracted from a request context `C`.
///
/// When a request is rate limited the rule's limit handler runs. The default
/// handler fails with [`LimiterError::RateLimited`]; a custom handler may
/// return `Ok(())` to let the request through anyway.
pub struct RateLimitRule<C> {
    name: String,
    windows: SlidingWindowProvider,
    key_fn: Box<KeyFn<C>>,
    on_limit: Box<OnLimitFn<C>>,
}

impl<C> RateLimitRule<C> {
    /// Start building a rule.
    pub fn builder(name: impl Into<String>, rate: Rate) -> RateLimitRuleBuilder<C> {
        RateLimitRuleBuilder {
            name: name.into(),
            rate,
            slot_provider: None,
            key_fn: None,
            on_limit: None,
        }
    }

    /// Name of the rule.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The windows of this rule.
    pub fn windows(&self) -> &SlidingWindowProvider {
        &self.windows
    }

    /// Apply the rule to `ctx` at `now` (Unix seconds).
    pub fn check_at(&self, ctx: &C, now: f64) -> Result<RuleOutcome> {
        let Some(key) = (self.key_fn)(ctx) else {
            trace!(rule = %self.name, "No key for request, skipping rate limit");
            return Ok(RuleOutcome::Skipped);
        };

        let decision = self.windows.is_rate_limited(&key, now);
        if let Decision::RateLimited { until } = decision {
            debug!(rule = %self.name, key = %key, until, "Request rate limited");
            let limited = Limited {
                rule: self.name.clone(),
                key: key.clone(),
                until,
            };
            (self.on_limit)(ctx, &limited)?;
        }

        Ok(RuleOutcome::Checked { key, decision })
    }

    /// Apply the rule to `ctx` at the current time.
    pub fn check(&self, ctx: &C) -> Result<RuleOutcome> {
        self.check_at(ctx, unix_now())
    }
}

impl<C> fmt::Debug for RateLimitRule<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitRule")
            .field("name", &self.name)
            .field("windows", &self.windows)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RateLimitRule`].
pub struct RateLimitRuleBuilder<C> {
    name: String,
    rate: Rate,
    slot_provider: Option<Arc<dyn SlotProvider>>,
    key_fn: Option<Box<KeyFn<C>>>,
    on_limit: Option<Box<OnLimitFn<C>>>,
}

impl<C> RateLimitRuleBuilder<C> {
    /// Use a custom slot provider instead of process-local slots.
    pub fn slot_provider(mut self, provider: Arc<dyn SlotProvider>) -> Self {
        self.slot_provider = Some(provider);
        self
    }

    /// Set the function deriving a logical key from a request.
    ///
    /// Returning `None` disables limiting for that request.
    pub fn key<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&C) -> Option<String> + Send + Sync + 'static,
    {
        self.key_fn = Some(Box::new(key_fn));
        self
    }

    /// Set the handler run for rate limited requests.
    pub fn on_limit<F>(mut self, on_limit: F) -> Self
    where
        F: Fn(&C, &Limited) -> Result<()> + Send + Sync + 'static,
    {
        self.on_limit = Some(Box::new(on_limit));
        self
    }

    /// Build the rule.
    pub fn build(self) -> Result<RateLimitRule<C>>
    where
        C: 'static,
    {
        let key_fn = self.key_fn.ok_or_else(|| {
            LimiterError::Config(format!("rule '{}' has no key function", self.name))
        })?;
        let slot_provider: Arc<dyn SlotProvider> = match self.slot_provider {
            Some(provider) => provider,
            None => Arc::new(MemorySlotProvider::new()),
        };
        let on_limit: Box<OnLimitFn<C>> = match self.on_limit {
            Some(on_limit) => on_limit,
            None => Box::new(reject::<C>),
        };

        Ok(RateLimitRule {
            windows: SlidingWindowProvider::new(self.rate, slot_provider)?
                .namespaced(self.name.clone()),
            name: self.name,
            key_fn,
            on_limit,
        })
    }
}

fn reject<C>(_ctx: &C, limited: &Limited) -> Result<()> {
    Err(limited.clone().into())
}
