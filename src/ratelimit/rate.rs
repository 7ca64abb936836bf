//! Rates of the form `N requests in P <unit>`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Time unit of a rate period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Period expressed in seconds
    Seconds,
    /// Period expressed in minutes
    Minutes,
    /// Period expressed in hours
    Hours,
}

impl TimeUnit {
    /// Number of seconds in one unit.
    pub fn scale(&self) -> f64 {
        match self {
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 3600.0,
        }
    }

    /// Normalize a unit token from a rate literal.
    ///
    /// Singular and plural seconds/minutes are recognized; every other token
    /// is read as hours.
    pub fn from_token(token: &str) -> Self {
        match token {
            "second" | "seconds" => TimeUnit::Seconds,
            "minute" | "minutes" => TimeUnit::Minutes,
            _ => TimeUnit::Hours,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Seconds => "seconds",
            TimeUnit::Minutes => "minutes",
            TimeUnit::Hours => "hours",
        }
    }
}

/// An immutable rate: at most `requests` requests every `period` `unit`s.
///
/// Fields are kept as floating point numbers because the literal form goes
/// through plain number parsing, which accepts negative and scientific
/// values. Range checks happen when a [`SlidingWindow`](super::SlidingWindow)
/// is built from the rate, not here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rate {
    /// Maximum number of requests allowed per period
    pub requests: f64,
    /// Length of the period, in `unit`s
    pub period: f64,
    /// Unit of `period`
    pub unit: TimeUnit,
}

impl Rate {
    /// Create a new rate.
    pub fn new(requests: f64, period: f64, unit: TimeUnit) -> Self {
        Self {
            requests,
            period,
            unit,
        }
    }

    /// Parse a literal such as `"10 requests in 20 minutes"`.
    pub fn parse(literal: &str) -> Result<Self> {
        let (requests, rest) = literal
            .split_once(" requests in ")
            .or_else(|| literal.split_once(" request in "))
            .ok_or_else(|| {
                LimiterError::InvalidRate(format!(
                    "'{}' is not of the form '<n> requests in <p> <unit>'",
                    literal
                ))
            })?;

        let (period, unit) = rest.trim().split_once(' ').unwrap_or((rest.trim(), ""));

        Ok(Self {
            requests: parse_number(literal, requests)?,
            period: parse_number(literal, period)?,
            unit: TimeUnit::from_token(unit.trim()),
        })
    }

    /// Length of the period in seconds.
    pub fn period_in_seconds(&self) -> f64 {
        self.period * self.unit.scale()
    }

    /// Check that a sliding window can be built from this rate.
    pub fn validate(&self) -> Result<()> {
        // Negated comparisons so that NaN fails as well.
        if !(self.period_in_seconds() >= 1.0) {
            return Err(LimiterError::Config(format!(
                "rate period must be at least one second, got {}s ({})",
                self.period_in_seconds(),
                self
            )));
        }
        if !(self.requests >= 0.0) {
            return Err(LimiterError::Config(format!(
                "rate requests must not be negative, got {} ({})",
                self.requests, self
            )));
        }
        Ok(())
    }
}

fn parse_number(literal: &str, field: &str) -> Result<f64> {
    field.trim().parse::<f64>().map_err(|e| {
        LimiterError::InvalidRate(format!("'{}': bad number '{}': {}", literal, field, e))
    })
}

impl FromStr for Rate {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        Rate::parse(s)
    }
}

impl TryFrom<String> for Rate {
    type Error = LimiterError;

    fn try_from(value: String) -> Result<Self> {
        Rate::parse(&value)
    }
}

impl From<Rate> for String {
    fn from(rate: Rate) -> Self {
        rate.to_string()
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} requests in {} {}",
            self.requests,
            self.period,
            self.unit.as_str()
        )
    }
}
