use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::{CollectorError, Result};

/// Drives `fut` until it finishes or `ctx` is cancelled, whichever comes first.
///
/// On cancellation the future is dropped, which releases whatever it holds.
pub async fn until_cancelled<F, T>(ctx: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(CollectorError::Cancelled),
        res = fut => res,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn passes_through_when_not_cancelled() {
        let ctx = CancellationToken::new();
        let value = assert_ok!(until_cancelled(&ctx, async { Ok(5) }).await);
        assert_eq!(value, 5);
    }

    #[tokio::test]
    async fn cancellation_wins_over_pending_work() {
        let ctx = CancellationToken::new();
        let child = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            child.cancel();
        });

        let err = assert_err!(
            until_cancelled(&ctx, async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await
        );
        assert!(matches!(err, CollectorError::Cancelled));
    }
}
