// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights
// reserved. SPDX-License-Identifier: Proprietary

//! Bounded retry with configurable backoff.
//!
//! [`RetryPolicy::decide`] is a pure function of the attempt number and the
//! error; all timing side effects (sleeping, jitter) live in [`retry`].

use reqwest::StatusCode;
use std::time::Duration;
use tracing::warn;

/// Delay schedule. `attempt` is 1-based: the delay after the first failure is
/// `delay(1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
	Fixed(Duration),
	Linear {
		base: Duration,
		step: Duration,
		max: Duration,
	},
	Exponential {
		base: Duration,
		factor: f64,
		max: Duration,
	},
}

impl Backoff {
	pub fn delay(&self, attempt: u32) -> Duration {
		let n = attempt.saturating_sub(1);
		match *self {
			Backoff::Fixed(d) => d,
			Backoff::Linear { base, step, max } => base.saturating_add(step.saturating_mul(n)).min(max),
			Backoff::Exponential { base, factor, max } => {
				let secs = base.as_secs_f64() * factor.powi(n.min(i32::MAX as u32) as i32);
				if !secs.is_finite() || secs >= max.as_secs_f64() {
					max
				} else {
					Duration::from_secs_f64(secs)
				}
			}
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
	Retry(Duration),
	GiveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub backoff: Backoff,
	/// Scale each delay by a random factor in [0.5, 1.5). Applied by [`retry`],
	/// never by [`RetryPolicy::decide`].
	pub jitter: bool,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			backoff: Backoff::Exponential {
				base: Duration::from_secs(1),
				factor: 2.0,
				max: Duration::from_secs(10),
			},
			jitter: false,
		}
	}
}

impl RetryPolicy {
	/// Policy for coordinator API calls: short delays, jittered.
	pub fn http() -> Self {
		Self {
			max_attempts: 3,
			backoff: Backoff::Exponential {
				base: Duration::from_millis(200),
				factor: 2.0,
				max: Duration::from_secs(5),
			},
			jitter: true,
		}
	}

	/// A single attempt, no retries.
	pub fn none() -> Self {
		Self {
			max_attempts: 1,
			backoff: Backoff::Fixed(Duration::ZERO),
			jitter: false,
		}
	}

	pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
		self.max_attempts = max_attempts.max(1);
		self
	}

	pub fn decide<E: RetryableError + ?Sized>(&self, attempt: u32, err: &E) -> RetryDecision {
		if !err.is_retryable() || attempt >= self.max_attempts {
			return RetryDecision::GiveUp;
		}
		RetryDecision::Retry(self.backoff.delay(attempt))
	}
}

pub trait RetryableError {
	fn is_retryable(&self) -> bool;
}

pub fn is_retryable_status(status: StatusCode) -> bool {
	matches!(
		status,
		StatusCode::TOO_MANY_REQUESTS
			| StatusCode::REQUEST_TIMEOUT
			| StatusCode::INTERNAL_SERVER_ERROR
			| StatusCode::BAD_GATEWAY
			| StatusCode::SERVICE_UNAVAILABLE
			| StatusCode::GATEWAY_TIMEOUT
	)
}

impl RetryableError for reqwest::Error {
	fn is_retryable(&self) -> bool {
		if self.is_timeout() || self.is_connect() {
			return true;
		}
		self.status().map(is_retryable_status).unwrap_or(false)
	}
}

fn jittered(delay: Duration) -> Duration {
	delay.mul_f64(0.5 + fastrand::f64())
}

/// Runs `f` until it succeeds, returns a non-retryable error, or the policy's
/// attempt budget is spent. The last error is returned unchanged.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
	F: FnMut() -> Fut,
	Fut: std::future::Future<Output = Result<T, E>>,
	E: RetryableError + std::fmt::Display,
{
	let mut attempt = 0;

	loop {
		attempt += 1;
		let err = match f().await {
			Ok(value) => return Ok(value),
			Err(err) => err,
		};

		match policy.decide(attempt, &err) {
			RetryDecision::GiveUp => {
				if err.is_retryable() {
					warn!(error = %err, attempt, max_attempts = policy.max_attempts, "max retry attempts exhausted");
				} else {
					warn!(error = %err, attempt, "non-retryable error encountered");
				}
				return Err(err);
			}
			RetryDecision::Retry(delay) => {
				let delay = if policy.jitter { jittered(delay) } else { delay };
				warn!(
					error = %err,
					attempt,
					max_attempts = policy.max_attempts,
					delay_ms = delay.as_millis() as u64,
					"retrying after error"
				);
				tokio::time::sleep(delay).await;
			}
		}
	}
}
