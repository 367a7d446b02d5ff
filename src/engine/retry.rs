use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::warn;

use crate::notify::NotifyError;
use crate::store::StoreError;

/// Errors that may succeed if the same call is made again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl Transient for NotifyError {
    fn is_transient(&self) -> bool {
        true
    }
}

/// Runs `call` once plus at most `retries` more times while it fails transiently.
pub async fn with_retry<T, E, F, Fut>(
    operation: &'static str,
    retries: u32,
    backoff: Duration,
    mut call: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < retries && err.is_transient() => {
                attempt += 1;
                warn!(operation, attempt, error = %err, "collaborator call failed; retrying");
                sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}
