use std::time::Duration;

use crate::StoreError;

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Runs `f`, retrying transient failures with exponential backoff. Exhausted
/// retries convert the error to a permanent one; permanent errors pass
/// through untouched.
pub fn with_backoff<T>(mut f: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 1..=MAX_ATTEMPTS {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < MAX_ATTEMPTS => {
                tracing::debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %err, "retrying storage operation");
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            Err(StoreError::Transient { path, msg }) => {
                return Err(StoreError::Permanent {
                    path,
                    msg: format!("retries exhausted after {MAX_ATTEMPTS} attempts: {msg}"),
                });
            }
            Err(err) => return Err(err),
        }
    }
    // The loop always returns by the last attempt.
    Err(StoreError::Permanent {
        path: String::new(),
        msg: "retry loop exited without a result".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transient() -> StoreError {
        StoreError::Transient {
            path: "x".to_string(),
            msg: "flaky".to_string(),
        }
    }

    #[test]
    fn recovers_from_transient_failures() {
        let mut remaining_failures = 2;
        let result = with_backoff(|| {
            if remaining_failures > 0 {
                remaining_failures -= 1;
                Err(transient())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn exhaustion_becomes_permanent() {
        let mut attempts = 0;
        let result: Result<(), _> = with_backoff(|| {
            attempts += 1;
            Err(transient())
        });
        assert_eq!(attempts, MAX_ATTEMPTS);
        match result.unwrap_err() {
            StoreError::Permanent { msg, .. } => assert!(msg.contains("retries exhausted")),
            other => panic!("expected Permanent, got {other:?}"),
        }
    }

    #[test]
    fn permanent_errors_do_not_retry() {
        let mut attempts = 0;
        let result: Result<(), _> = with_backoff(|| {
            attempts += 1;
            Err(StoreError::NotFound("gone".to_string()))
        });
        assert_eq!(attempts, 1);
        assert!(matches!(result.unwrap_err(), StoreError::NotFound(_)));
    }
}
