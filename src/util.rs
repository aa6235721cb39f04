use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, TransactionContext};
use std::any::Any;
use std::future::Future;

/// Run `callback` inside a Sentry performance transaction named after the task type.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let hub = Hub::current();

    let tx_ctx = TransactionContext::new(transaction_name, "task.process");
    let tx = hub.start_transaction(tx_ctx);
    hub.configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let result = callback().await;

    tx.set_status(if result.is_ok() {
        SpanStatus::Ok
    } else {
        SpanStatus::UnknownError
    });
    tx.finish();

    result
}

/// Turn a caught panic payload into an error for the retry planner.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("task panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("task panicked: {message}")
    } else {
        anyhow!("task panicked")
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::panic::AssertUnwindSafe;

    async fn static_panic(fail: bool) -> u8 {
        if fail {
            panic!("codec missing");
        }
        0
    }

    async fn formatted_panic(segment: u8) -> u8 {
        if segment > 0 {
            panic!("segment {segment} missing");
        }
        0
    }

    #[tokio::test]
    async fn panic_messages_are_preserved() {
        let caught = AssertUnwindSafe(static_panic(true))
            .catch_unwind()
            .await
            .unwrap_err();
        assert_eq!(
            try_to_extract_panic_info(&*caught).to_string(),
            "task panicked: codec missing"
        );

        let formatted = AssertUnwindSafe(formatted_panic(3))
            .catch_unwind()
            .await
            .unwrap_err();
        assert_eq!(
            try_to_extract_panic_info(&*formatted).to_string(),
            "task panicked: segment 3 missing"
        );
    }

    #[tokio::test]
    async fn sentry_transaction_passes_results_through() {
        let ok: Result<u8, ()> = with_sentry_transaction("embed", || async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let err: Result<(), &str> = with_sentry_transaction("embed", || async { Err("boom") }).await;
        assert_eq!(err, Err("boom"));
    }
}
