use anyhow::{Context, bail};
use reqwest::StatusCode;
use reqwest::blocking::{RequestBuilder, Response};
use reqwest::header::HeaderMap;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

const MAX_ATTEMPTS: u32 = 3;
const FALLBACK_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Sends the request built by `build`, retrying rate-limit and availability
/// responses. The wait honours `retry-after`, then `x-ratelimit-reset`.
pub(crate) fn send_with_retry<F>(mut build: F) -> anyhow::Result<Response>
where
    F: FnMut() -> anyhow::Result<RequestBuilder>,
{
    for attempt in 1..=MAX_ATTEMPTS {
        let response = build()?.send().context("send request")?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if is_retryable(status) && attempt < MAX_ATTEMPTS {
            let delay = retry_delay_from_headers(response.headers())
                .unwrap_or(FALLBACK_DELAY)
                .min(MAX_DELAY);
            warn!(status = status.as_u16(), attempt, delay_secs = delay.as_secs(), "throttled; retrying");
            thread::sleep(delay);
            continue;
        }
        return response
            .error_for_status()
            .context("request rejected");
    }
    bail!("request failed after {MAX_ATTEMPTS} attempts");
}

fn is_retryable(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
    retry_after_seconds(headers)
        .or_else(|| ratelimit_reset_seconds(headers))
        .map(Duration::from_secs)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn retry_after_seconds(headers: &HeaderMap) -> Option<u64> {
    header_u64(headers, "retry-after")
}

fn ratelimit_reset_seconds(headers: &HeaderMap) -> Option<u64> {
    let reset = header_u64(headers, "x-ratelimit-reset")?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    reset.checked_sub(now).filter(|delay| *delay > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }

    #[test]
    fn retry_after_wins_over_reset() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("5"));
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&(now() + 100).to_string()).unwrap(),
        );
        assert_eq!(retry_delay_from_headers(&headers), Some(Duration::from_secs(5)));
    }

    #[test]
    fn reset_in_the_past_gives_no_delay() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&(now() - 10).to_string()).unwrap(),
        );
        assert_eq!(retry_delay_from_headers(&headers), None);
    }

    #[test]
    fn reset_in_the_future_is_relative() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&(now() + 30).to_string()).unwrap(),
        );
        let delay = ratelimit_reset_seconds(&headers).unwrap();
        assert!((25..=30).contains(&delay));
    }

    #[test]
    fn only_throttling_statuses_retry() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
        assert!(!is_retryable(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
