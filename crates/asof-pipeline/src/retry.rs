//! Bounded retries with a per-call timeout for adapter calls.

use std::{future::Future, time::Duration};

use asof_core::{Error, Result};
use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::config::LabConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts, at least one.
  pub attempts:      usize,
  pub call_timeout:  Duration,
  pub initial_delay: Duration,
}

impl RetryPolicy {
  pub fn from_config(cfg: &LabConfig) -> Self {
    Self {
      attempts:      cfg.adapter_retries.max(1),
      call_timeout:  Duration::from_millis(cfg.adapter_timeout_ms),
      initial_delay: Duration::from_millis(cfg.retry_backoff_ms),
    }
  }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts. Each attempt is cut off after `call_timeout`; a timeout counts
/// as an [`Error::Adapter`] failure. Only adapter errors are retried.
pub async fn retry_adapter_call<F, Fut, T>(
  source: &str,
  policy: RetryPolicy,
  mut op: F,
) -> Result<T>
where
  F: FnMut(usize) -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let mut delay = policy.initial_delay;
  let mut attempt = 1;
  loop {
    let outcome = match timeout(policy.call_timeout, op(attempt)).await {
      Ok(outcome) => outcome,
      Err(_) => Err(Error::Adapter {
        source_name: source.to_owned(),
        message:     format!("call timed out after {:?}", policy.call_timeout),
      }),
    };
    match outcome {
      Ok(v) => return Ok(v),
      Err(e @ Error::Adapter { .. }) if attempt < policy.attempts => {
        warn!(source, attempt, error = %e, "adapter call failed, retrying");
        sleep(delay).await;
        delay = delay.saturating_mul(2);
        attempt += 1;
      }
      Err(e) => return Err(e),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;

  fn policy(attempts: usize, call_timeout_ms: u64) -> RetryPolicy {
    RetryPolicy {
      attempts,
      call_timeout: Duration::from_millis(call_timeout_ms),
      initial_delay: Duration::from_millis(1),
    }
  }

  fn adapter_error() -> Error {
    Error::Adapter { source_name: "mock".into(), message: "boom".into() }
  }

  #[tokio::test]
  async fn retries_until_success() {
    let counter = AtomicUsize::new(0);
    let res = retry_adapter_call("mock", policy(4, 1_000), |_| {
      let current = counter.fetch_add(1, Ordering::Relaxed);
      async move { if current < 2 { Err(adapter_error()) } else { Ok(7) } }
    })
    .await;

    assert_eq!(res.unwrap(), 7);
    assert_eq!(counter.load(Ordering::Relaxed), 3);
  }

  #[tokio::test]
  async fn gives_up_after_the_bound() {
    let counter = AtomicUsize::new(0);
    let res: Result<()> = retry_adapter_call("mock", policy(3, 1_000), |_| {
      counter.fetch_add(1, Ordering::Relaxed);
      async { Err(adapter_error()) }
    })
    .await;

    assert!(matches!(res, Err(Error::Adapter { .. })));
    assert_eq!(counter.load(Ordering::Relaxed), 3);
  }

  #[tokio::test]
  async fn validation_errors_are_not_retried() {
    let counter = AtomicUsize::new(0);
    let res: Result<()> = retry_adapter_call("mock", policy(5, 1_000), |_| {
      counter.fetch_add(1, Ordering::Relaxed);
      async { Err(Error::Validation("bad row".into())) }
    })
    .await;

    assert!(matches!(res, Err(Error::Validation(_))));
    assert_eq!(counter.load(Ordering::Relaxed), 1);
  }

  #[tokio::test]
  async fn hung_call_times_out() {
    let res: Result<()> = retry_adapter_call("slow", policy(2, 5), |_| async {
      sleep(Duration::from_secs(60)).await;
      Ok(())
    })
    .await;

    let err = res.unwrap_err();
    assert!(matches!(err, Error::Adapter { ref source_name, .. } if source_name == "slow"));
  }
}
