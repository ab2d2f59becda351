use std::thread;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::generation::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Fatal,
    RateLimited,
    Transient,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::RateLimited => "rate_limited",
            Self::Transient => "transient",
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "429",
    "too many requests",
    "quota exceeded",
    "throttl",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "network",
    "temporar",
    "unavailable",
    "overloaded",
    "502",
    "503",
    "504",
];

/// Maps a service failure onto the retry taxonomy. Anything unrecognized is
/// fatal so that unknown failures surface instead of burning retries.
pub fn classify(error: &ServiceError) -> ErrorClass {
    match error {
        ServiceError::Http { status: 429, .. } => ErrorClass::RateLimited,
        ServiceError::Http {
            status: 401 | 403, ..
        } => ErrorClass::Fatal,
        ServiceError::Http { status, message, .. } => {
            if contains_marker(message, RATE_LIMIT_MARKERS) {
                ErrorClass::RateLimited
            } else if *status == 408 || (500..=599).contains(status) {
                ErrorClass::Transient
            } else {
                ErrorClass::Fatal
            }
        }
        ServiceError::Timeout(_) | ServiceError::Network(_) => ErrorClass::Transient,
        ServiceError::Other(message) => classify_message(message),
    }
}

fn classify_message(message: &str) -> ErrorClass {
    if contains_marker(message, RATE_LIMIT_MARKERS) {
        ErrorClass::RateLimited
    } else if contains_marker(message, TRANSIENT_MARKERS) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

fn contains_marker(message: &str, markers: &[&str]) -> bool {
    let lowered = message.to_ascii_lowercase();
    markers.iter().any(|marker| lowered.contains(marker))
}

/// `min(base * 2^attempt, cap)` plus additive jitter of `jitter_fraction`
/// times that value. `jitter_fraction` is clamped to `[0, 1]`, so the result
/// never exceeds `2 * cap`.
pub fn next_delay(attempt: u32, base: Duration, cap: Duration, jitter_fraction: f64) -> Duration {
    let factor = 2_u32.saturating_pow(attempt);
    let computed = base.saturating_mul(factor).min(cap);
    let jitter = computed.mul_f64(jitter_fraction.clamp(0.0, 1.0));
    computed.saturating_add(jitter)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
    pub cap: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let fraction = if self.jitter { rng.random::<f64>() } else { 0.0 };
        next_delay(attempt, self.base, self.cap, fraction)
    }
}

#[derive(Debug)]
pub struct RetryNotice<'a> {
    pub attempt: u32,
    pub class: ErrorClass,
    pub delay: Duration,
    pub error: &'a ServiceError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub error: ServiceError,
    pub class: ErrorClass,
    pub attempts: u32,
}

/// Runs `call` until it succeeds, fails fatally, or exhausts
/// `policy.max_retries` retries. Returns the value and the number of attempts
/// used. `on_retry` fires before every sleep.
pub fn call_with_retry<T, F, N>(
    policy: &RetryPolicy,
    mut call: F,
    mut on_retry: N,
) -> Result<(T, u32), RetryFailure>
where
    F: FnMut(u32) -> Result<T, ServiceError>,
    N: FnMut(&RetryNotice<'_>),
{
    let mut rng = rand::rng();
    let mut attempt = 0_u32;

    loop {
        match call(attempt) {
            Ok(value) => return Ok((value, attempt + 1)),
            Err(error) => {
                let class = classify(&error);
                let attempts = attempt + 1;
                if !class.is_retryable() || attempt >= policy.max_retries {
                    return Err(RetryFailure {
                        error,
                        class,
                        attempts,
                    });
                }

                let mut delay = policy.delay_for(attempt, &mut rng);
                if class == ErrorClass::RateLimited {
                    if let Some(hint_ms) = error.retry_after_ms() {
                        delay = delay.max(Duration::from_millis(hint_ms).min(policy.cap));
                    }
                }

                on_retry(&RetryNotice {
                    attempt: attempts,
                    class,
                    delay,
                    error: &error,
                });
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
        }
    }
}
