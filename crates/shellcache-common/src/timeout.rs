//! Bounded timeouts for single network attempts.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::CommonError;

/// Run an operation with an optional timeout.
///
/// `None` awaits the operation unbounded.
pub async fn with_timeout<T, F, Fut>(
    timeout: Option<Duration>,
    operation: F,
) -> Result<T, CommonError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, operation()).await.map_err(|_| {
            debug!(?limit, "Operation exceeded deadline");
            CommonError::Timeout(limit)
        }),
        None => Ok(operation().await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_timeout_elapses() {
        let result = with_timeout(Some(Duration::from_millis(10)), || async {
            sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(matches!(result, Err(CommonError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_fast_operation_completes() {
        let result = with_timeout(Some(Duration::from_secs(1)), || async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_unbounded() {
        let result = with_timeout(None, || async {
            sleep(Duration::from_millis(5)).await;
            "done"
        })
        .await;
        assert_eq!(result.unwrap(), "done");
    }
}
