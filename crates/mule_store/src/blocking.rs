use tokio::task::JoinError;

/// Marker for a blocking task that was cancelled by runtime shutdown.
pub struct Cancelled;

/// Run a blocking store operation to completion from async context.
///
/// Panics inside the task are propagated; cancellation surfaces as an error
/// converted from [`Cancelled`].
pub async fn run_blocking_task<T, E, F>(f: F) -> Result<T, E>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: From<Cancelled> + Send + 'static,
{
    match tokio::task::spawn_blocking(f)
        .await
        .map_err(JoinError::try_into_panic)
    {
        Ok(result) => result,
        Err(Err(_)) => Err(E::from(Cancelled)),
        Err(Ok(payload)) => std::panic::resume_unwind(payload),
    }
}
