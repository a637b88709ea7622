//! Retrying writes that lost an optimistic-concurrency race.

use std::{future::Future, time::Duration};

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use super::ApiError;

/// Fixed-step backoff for conflict retries.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
	/// Total number of attempts, the first one included.
	pub steps: u32,
	#[serde(with = "millis", rename = "initialDelayMillis")]
	pub initial_delay: Duration,
	/// Multiplier applied to the delay after every attempt.
	pub factor: f64,
	/// Up to this fraction of the delay is added at random.
	pub jitter: f64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			steps: 5,
			initial_delay: Duration::from_millis(10),
			factor: 1.0,
			jitter: 0.1,
		}
	}
}

#[derive(Debug, Error, PartialEq)]
pub enum InvalidRetryPolicy {
	#[error("retry factor must be a finite non-negative number, got {0}")]
	Factor(f64),
	#[error("retry jitter must be a finite non-negative number, got {0}")]
	Jitter(f64),
}

mod millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer};

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

impl RetryPolicy {
	/// Upper bound for a single backoff sleep.
	const MAX_DELAY: Duration = Duration::from_secs(60);

	pub fn validate(&self) -> Result<(), InvalidRetryPolicy> {
		if !self.factor.is_finite() || self.factor < 0.0 {
			return Err(InvalidRetryPolicy::Factor(self.factor));
		}
		if !self.jitter.is_finite() || self.jitter < 0.0 {
			return Err(InvalidRetryPolicy::Jitter(self.jitter));
		}
		Ok(())
	}

	fn jittered(&self, delay: Duration) -> Duration {
		if !self.jitter.is_finite() || self.jitter <= 0.0 {
			return delay;
		}
		let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
		scaled(delay, 1.0 + extra)
	}

	fn next_delay(&self, delay: Duration) -> Duration {
		if self.factor.is_finite() && self.factor > 0.0 {
			scaled(delay, self.factor)
		} else {
			delay
		}
	}
}

/// `delay * factor`, saturating at [`RetryPolicy::MAX_DELAY`].
fn scaled(delay: Duration, factor: f64) -> Duration {
	Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
		.map_or(RetryPolicy::MAX_DELAY, |scaled| scaled.min(RetryPolicy::MAX_DELAY))
}

/// Run `op` until it succeeds, fails with anything but a conflict, or runs
/// out of attempts. The last error is returned.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ApiError>
where
	F: FnMut() -> Fut,
	Fut: Future<Output = Result<T, ApiError>>,
{
	let attempts = policy.steps.max(1);
	let mut delay = policy.initial_delay;

	let mut attempt = 1;

	loop {
		match op().await {
			Err(e) if e.is_conflict() && attempt < attempts => {
				let sleep = policy.jittered(delay);
				tracing::debug!(attempt, delay = ?sleep, error = %e, "conflict, retrying");
				tokio::time::sleep(sleep).await;
				delay = policy.next_delay(delay);
				attempt += 1;
			}
			result => return result,
		}
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU32, Ordering};

	use assert_matches::assert_matches;
	use rstest::rstest;

	use super::*;

	fn conflict() -> ApiError {
		ApiError::conflict("configmaps", "a")
	}

	#[tokio::test(start_paused = true)]
	async fn test_succeeds_after_conflicts() {
		let calls = AtomicU32::new(0);
		let result = retry_on_conflict(&RetryPolicy::default(), || async {
			if calls.fetch_add(1, Ordering::SeqCst) < 2 {
				Err(conflict())
			} else {
				Ok("done")
			}
		})
		.await;

		assert_eq!(result.unwrap(), "done");
		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_gives_up_after_steps() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = retry_on_conflict(&RetryPolicy::default(), || async {
			calls.fetch_add(1, Ordering::SeqCst);
			Err(conflict())
		})
		.await;

		assert!(result.unwrap_err().is_conflict());
		assert_eq!(calls.load(Ordering::SeqCst), 5);
	}

	#[tokio::test(start_paused = true)]
	async fn test_other_errors_are_not_retried() {
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = retry_on_conflict(&RetryPolicy::default(), || async {
			calls.fetch_add(1, Ordering::SeqCst);
			Err(ApiError::status(500, "InternalError", "boom"))
		})
		.await;

		assert_matches!(result, Err(ApiError::Status { code: 500, .. }));
		assert_eq!(calls.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_huge_factor_saturates() {
		let policy = RetryPolicy {
			factor: 1.0e30,
			..RetryPolicy::default()
		};
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = retry_on_conflict(&policy, || async {
			calls.fetch_add(1, Ordering::SeqCst);
			Err(conflict())
		})
		.await;

		assert!(result.unwrap_err().is_conflict());
		assert_eq!(calls.load(Ordering::SeqCst), 5);
		assert_eq!(policy.next_delay(Duration::from_millis(10)), RetryPolicy::MAX_DELAY);
	}

	#[tokio::test(start_paused = true)]
	async fn test_nan_jitter_is_ignored() {
		let policy = RetryPolicy {
			jitter: f64::NAN,
			..RetryPolicy::default()
		};
		let calls = AtomicU32::new(0);
		let result: Result<(), _> = retry_on_conflict(&policy, || async {
			calls.fetch_add(1, Ordering::SeqCst);
			Err(conflict())
		})
		.await;

		assert!(result.unwrap_err().is_conflict());
		assert_eq!(calls.load(Ordering::SeqCst), 5);
	}

	#[rstest]
	#[case(RetryPolicy { factor: f64::INFINITY, ..RetryPolicy::default() }, InvalidRetryPolicy::Factor(f64::INFINITY))]
	#[case(RetryPolicy { factor: -2.0, ..RetryPolicy::default() }, InvalidRetryPolicy::Factor(-2.0))]
	#[case(RetryPolicy { jitter: -0.5, ..RetryPolicy::default() }, InvalidRetryPolicy::Jitter(-0.5))]
	fn test_validate_rejects(#[case] policy: RetryPolicy, #[case] expected: InvalidRetryPolicy) {
		assert_eq!(policy.validate(), Err(expected));
	}

	#[test]
	fn test_validate_rejects_nan_jitter() {
		let policy = RetryPolicy {
			jitter: f64::NAN,
			..RetryPolicy::default()
		};
		assert_matches!(policy.validate(), Err(InvalidRetryPolicy::Jitter(_)));
	}

	#[test]
	fn test_jitter_bounds() {
		let policy = RetryPolicy::default();
		for _ in 0..100 {
			let delay = policy.jittered(Duration::from_millis(10));
			assert!(delay >= Duration::from_millis(10));
			assert!(delay < Duration::from_millis(12));
		}
	}
}
