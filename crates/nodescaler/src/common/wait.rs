use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::Error;

/// Converts a configured timeout into a poll deadline. A zero timeout means "wait forever".
pub fn deadline_from_timeout(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}

/// Repeatedly calls `probe` every `interval` until it yields a value.
///
/// `probe` returns `Ok(None)` to keep polling and `Err` to abort immediately.
/// Fails with [`Error::Timeout`] once `timeout` elapses; `None` polls without a deadline.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    timeout: Option<Duration>,
    interval: Duration,
    mut probe: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = crate::Result<Option<T>>>,
{
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    loop {
        if let Some(value) = probe().await? {
            return Ok(value);
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    what: what.to_string(),
                    timeout: timeout.unwrap_or_default(),
                });
            }
        }
        log::debug!("Still waiting for {what}");
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{deadline_from_timeout, poll_until};
    use crate::Error;

    #[tokio::test(start_paused = true)]
    async fn poll_returns_value() {
        let mut attempts = 0;
        let value = poll_until("value", Some(Duration::from_secs(10)), Duration::from_secs(1), || {
            attempts += 1;
            let done = attempts == 3;
            async move { Ok(done.then_some(attempts)) }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out() {
        let result: crate::Result<()> =
            poll_until("never", Some(Duration::from_secs(5)), Duration::from_secs(1), || async {
                Ok(None)
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_aborts_on_error() {
        let result: crate::Result<()> = poll_until("fail", None, Duration::from_secs(1), || async {
            Err(Error::NotFound("instance x".to_string()))
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn zero_timeout_has_no_deadline() {
        assert_eq!(deadline_from_timeout(Duration::ZERO), None);
        assert_eq!(
            deadline_from_timeout(Duration::from_secs(3)),
            Some(Duration::from_secs(3))
        );
    }
}
