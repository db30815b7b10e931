// Exponential-backoff retry transport over reqwest.
//
// Retries on {408, 429, 500, 502, 503, 504} and on network-level transport
// errors. 429 responses use a doubled base delay (2s floor) and honor a
// numeric Retry-After header capped at max_delay. Exhausted retries return
// the last retryable response as-is; transport errors re-raise the last one.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff policy for [`fetch_with_retry`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
  /// Maximum retry attempts after the initial request
  pub max_retries: u32,
  /// Initial backoff duration
  pub base_delay: Duration,
  /// Cap on any single backoff
  pub max_delay: Duration,
  /// Floor on the doubled base delay applied to 429 responses
  pub rate_limit_floor: Duration,
  /// Whether to add up to 25% jitter to each delay
  pub jitter: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 5,
      base_delay: Duration::from_millis(1000),
      max_delay: Duration::from_millis(60000),
      rate_limit_floor: Duration::from_millis(2000),
      jitter: true,
    }
  }
}

impl RetryPolicy {
  /// `min(base * 2^attempt, max_delay)`, with optional jitter.
  pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
    let base = self.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
    let delay = Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()));
    self.apply_jitter(delay)
  }

  /// Delay for a 429 response. The server's Retry-After wins when present,
  /// capped at max_delay; otherwise the base delay is doubled with a 2s floor.
  pub fn delay_for_rate_limit(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    if let Some(secs) = retry_after_secs {
      let delay = Duration::from_secs(secs).min(self.max_delay);
      return self.apply_jitter(delay);
    }

    let base = (self.base_delay * 2).max(self.rate_limit_floor);
    let delay = Duration::from_secs_f64((base.as_secs_f64() * 2f64.powi(attempt as i32)).min(self.max_delay.as_secs_f64()));
    self.apply_jitter(delay)
  }

  fn apply_jitter(&self, delay: Duration) -> Duration {
    if !self.jitter {
      return delay;
    }
    let factor = 1.0 + rand_f64() * 0.25;
    Duration::from_secs_f64(delay.as_secs_f64() * factor).min(self.max_delay)
  }
}

/// A simple pseudo-random number generator for jitter (no external deps)
fn rand_f64() -> f64 {
  use std::time::{SystemTime, UNIX_EPOCH};

  let nanos = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .subsec_nanos();

  (nanos as f64 / u32::MAX as f64).fract()
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
  #[error("request body is not rewindable, cannot retry")]
  NotRewindable,
  #[error(transparent)]
  Transport(#[from] reqwest::Error),
}

/// HTTP statuses that warrant a retry.
pub fn is_retryable_status(status: StatusCode) -> bool {
  matches!(status.as_u16(), 408 | 429 | 500 | 502 | 503 | 504)
}

/// Transport errors that look like transient network failures.
pub fn is_network_error(error: &reqwest::Error) -> bool {
  if error.is_connect() || error.is_timeout() {
    return true;
  }
  let message = error.to_string();
  message.contains("connection refused") || message.contains("dns error") || message.contains("error sending request")
}

fn retry_after_seconds(response: &Response) -> Option<u64> {
  response
    .headers()
    .get(reqwest::header::RETRY_AFTER)
    .and_then(|v| v.to_str().ok())
    .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Issue a request with retries per the policy.
///
/// Non-retryable statuses (including non-2xx ones) are returned as-is without
/// further attempts; callers decide how to interpret them.
pub async fn fetch_with_retry(builder: RequestBuilder, policy: &RetryPolicy) -> Result<Response, FetchError> {
  let mut attempt = 0u32;

  loop {
    let request = builder.try_clone().ok_or(FetchError::NotRewindable)?;

    match request.send().await {
      Ok(response) => {
        let status = response.status();
        if !is_retryable_status(status) {
          return Ok(response);
        }
        if attempt >= policy.max_retries {
          warn!(status = %status, attempts = attempt + 1, "Retries exhausted, returning last response");
          return Ok(response);
        }

        let delay = if status == StatusCode::TOO_MANY_REQUESTS {
          policy.delay_for_rate_limit(attempt, retry_after_seconds(&response))
        } else {
          policy.delay_for_attempt(attempt)
        };
        debug!(
          status = %status,
          attempt = attempt + 1,
          max_retries = policy.max_retries,
          delay_ms = delay.as_millis(),
          "Retryable status, backing off"
        );
        sleep(delay).await;
      }
      Err(e) => {
        if !is_network_error(&e) {
          return Err(e.into());
        }
        if attempt >= policy.max_retries {
          warn!(err = %e, attempts = attempt + 1, "Retries exhausted after transport error");
          return Err(e.into());
        }

        let delay = policy.delay_for_attempt(attempt);
        warn!(
          err = %e,
          attempt = attempt + 1,
          max_retries = policy.max_retries,
          delay_ms = delay.as_millis(),
          "Transport error, backing off"
        );
        sleep(delay).await;
      }
    }

    attempt += 1;
  }
}

#[cfg(test)]
mod tests {
  use pretty_assertions::assert_eq;

  use super::*;
  use crate::test_server::{ScriptedServer, json_response, status_response};

  fn no_jitter(policy: RetryPolicy) -> RetryPolicy {
    RetryPolicy {
      jitter: false,
      ..policy
    }
  }

  fn fast_policy() -> RetryPolicy {
    RetryPolicy {
      max_retries: 5,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(10),
      rate_limit_floor: Duration::from_millis(2),
      jitter: false,
    }
  }

  #[test]
  fn test_exponential_schedule() {
    let policy = no_jitter(RetryPolicy::default());
    assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
    assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
    assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
    assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(8000));
  }

  #[test]
  fn test_schedule_respects_max_delay() {
    let policy = no_jitter(RetryPolicy::default());
    // 1000ms * 2^10 >> 60s cap
    assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(60000));
  }

  #[test]
  fn test_rate_limit_delay_doubles_base_with_floor() {
    let policy = no_jitter(RetryPolicy::default());
    // Default base 1000ms doubled is exactly the 2000ms floor
    assert_eq!(policy.delay_for_rate_limit(0, None), Duration::from_millis(2000));

    let small = no_jitter(RetryPolicy {
      base_delay: Duration::from_millis(100),
      ..Default::default()
    });
    assert_eq!(small.delay_for_rate_limit(0, None), Duration::from_millis(2000));
  }

  #[test]
  fn test_retry_after_honored_and_capped() {
    let policy = no_jitter(RetryPolicy::default());
    assert_eq!(policy.delay_for_rate_limit(0, Some(5)), Duration::from_secs(5));
    // Capped at max_delay
    assert_eq!(policy.delay_for_rate_limit(0, Some(300)), Duration::from_secs(60));
  }

  #[test]
  fn test_retryable_statuses() {
    for code in [408u16, 429, 500, 502, 503, 504] {
      assert!(is_retryable_status(StatusCode::from_u16(code).unwrap()), "{}", code);
    }
    for code in [200u16, 201, 400, 401, 403, 404, 422] {
      assert!(!is_retryable_status(StatusCode::from_u16(code).unwrap()), "{}", code);
    }
  }

  #[tokio::test]
  async fn test_429_then_200_makes_two_calls() {
    let server = ScriptedServer::spawn(vec![
      status_response(429, ""),
      json_response(200, r#"{"ok":true}"#),
    ])
    .await;

    let client = reqwest::Client::new();
    let response = fetch_with_retry(client.get(server.url("/")), &fast_policy()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.hits(), 2);
  }

  #[tokio::test]
  async fn test_client_errors_not_retried() {
    for code in [400u16, 401, 403, 404] {
      let server = ScriptedServer::spawn(vec![status_response(code, "")]).await;
      let client = reqwest::Client::new();
      let response = fetch_with_retry(client.get(server.url("/")), &fast_policy()).await.unwrap();

      assert_eq!(response.status().as_u16(), code);
      assert_eq!(server.hits(), 1, "status {} should not be retried", code);
    }
  }

  #[tokio::test]
  async fn test_exhausted_retries_return_last_response() {
    let responses = (0..6).map(|_| status_response(503, "")).collect();
    let server = ScriptedServer::spawn(responses).await;

    let client = reqwest::Client::new();
    let response = fetch_with_retry(client.get(server.url("/")), &fast_policy()).await.unwrap();

    // Returned, not raised
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(server.hits(), 6); // initial + 5 retries
  }

  #[tokio::test]
  async fn test_transport_error_raised_after_retries() {
    // Nothing is listening on this port
    let client = reqwest::Client::new();
    let policy = RetryPolicy {
      max_retries: 1,
      base_delay: Duration::from_millis(1),
      max_delay: Duration::from_millis(5),
      jitter: false,
      ..Default::default()
    };

    let result = fetch_with_retry(client.get("http://127.0.0.1:1/unreachable"), &policy).await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_retry_after_header_parsed() {
    let server = ScriptedServer::spawn(vec![
      status_response_with_header(429, "Retry-After: 0"),
      json_response(200, r#"{"ok":true}"#),
    ])
    .await;

    let client = reqwest::Client::new();
    let response = fetch_with_retry(client.get(server.url("/")), &fast_policy()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(server.hits(), 2);
  }

  fn status_response_with_header(code: u16, header: &str) -> String {
    format!(
      "HTTP/1.1 {} X\r\n{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
      code, header
    )
  }
}
