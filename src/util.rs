use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use sentry_core::TransactionContext;
use std::any::Any;
use std::future::Future;

/// Turn panic payloads into something loggable.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<&str>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

/// Run `callback` inside a sentry performance transaction named after the
/// job type.
pub(crate) async fn with_sentry_transaction<F, Fut, R, E>(
    transaction_name: &str,
    callback: F,
) -> Result<R, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let tx_ctx = TransactionContext::new(transaction_name, "queue.task");
    let tx = sentry_core::start_transaction(tx_ctx);

    let result = callback().await;

    tx.set_status(match result {
        Ok(_) => SpanStatus::Ok,
        Err(_) => SpanStatus::InternalError,
    });
    tx.finish();

    result
}
