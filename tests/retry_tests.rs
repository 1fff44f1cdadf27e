use anyhow::{Result, anyhow};
use dispatch_service::{
    models::retry::RetryConfig,
    utils::{is_retryable_status, retry_with_backoff},
};
use reqwest::StatusCode;
use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};
use tokio::time::Instant;

fn fast_config(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        initial_delay_ms: 10,
        max_delay_ms: 100,
        backoff_multiplier: 2,
    }
}

/// Test: Successful operations complete without retry
#[tokio::test]
async fn test_successful_operation_no_retry() -> Result<()> {
    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&fast_config(3), || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>("accepted")
        }
    })
    .await?;

    assert_eq!(result, "accepted");
    assert_eq!(attempt_count.load(Ordering::SeqCst), 1, "Should only attempt once");

    Ok(())
}

/// Test: Transient failures are retried until the call succeeds
#[tokio::test]
async fn test_transient_failures_are_retried() -> Result<()> {
    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&fast_config(5), || {
        let counter = Arc::clone(&counter);
        async move {
            let attempts = counter.fetch_add(1, Ordering::SeqCst);
            if attempts < 2 {
                Err(anyhow!("503 from provider"))
            } else {
                Ok("accepted")
            }
        }
    })
    .await?;

    assert_eq!(result, "accepted");
    assert_eq!(attempt_count.load(Ordering::SeqCst), 3, "Should retry 2 times then succeed");

    Ok(())
}

/// Test: Persistent failures stop after max_attempts
#[tokio::test]
async fn test_persistent_failure_exhausts_retries() -> Result<()> {
    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&fast_config(4), || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(anyhow!("Provider unavailable"))
        }
    })
    .await;

    assert!(result.is_err(), "Should fail after max attempts");
    assert_eq!(
        attempt_count.load(Ordering::SeqCst),
        4,
        "Should attempt exactly max_attempts times"
    );

    Ok(())
}

/// Test: An inner error is a final answer and is never retried
#[tokio::test]
async fn test_inner_error_is_not_retried() -> Result<()> {
    let attempt_count = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempt_count);

    let result = retry_with_backoff(&fast_config(5), || {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<Result<String, anyhow::Error>, anyhow::Error>(Err(anyhow!("400 invalid number")))
        }
    })
    .await?;

    assert!(result.is_err());
    assert_eq!(attempt_count.load(Ordering::SeqCst), 1);

    Ok(())
}

/// Test: Retry delays grow between attempts
#[tokio::test]
async fn test_backoff_delays_grow() -> Result<()> {
    let config = RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 50,
        max_delay_ms: 1000,
        backoff_multiplier: 2,
    };

    let start = Instant::now();
    let attempt_times = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let times = Arc::clone(&attempt_times);

    let _ = retry_with_backoff(&config, || {
        let times = Arc::clone(&times);
        async move {
            times.lock().await.push(start.elapsed().as_millis());
            Err::<String, _>(anyhow!("Fail"))
        }
    })
    .await;

    let times = attempt_times.lock().await;
    assert_eq!(times.len(), 3);

    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= 40, "First delay too short: {}", first_gap);
    assert!(second_gap >= 80, "Second delay too short: {}", second_gap);

    Ok(())
}

/// Test: Retry state is independent per operation
#[tokio::test]
async fn test_retry_state_independence() -> Result<()> {
    let config = Arc::new(fast_config(5));

    let config1 = Arc::clone(&config);
    let handle1 = tokio::spawn(async move {
        retry_with_backoff(&config1, || async { Err::<String, _>(anyhow!("Always fail")) }).await
    });

    let config2 = Arc::clone(&config);
    let counter2 = Arc::new(AtomicU32::new(0));
    let counter2_clone = Arc::clone(&counter2);
    let handle2 = tokio::spawn(async move {
        retry_with_backoff(&config2, || {
            let counter = Arc::clone(&counter2_clone);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(anyhow!("Fail"))
                } else {
                    Ok("accepted")
                }
            }
        })
        .await
    });

    let (result1, result2) = tokio::join!(handle1, handle2);

    assert!(result1?.is_err(), "Operation 1 should fail");
    assert!(result2?.is_ok(), "Operation 2 should succeed");
    assert_eq!(counter2.load(Ordering::SeqCst), 3, "Operation 2 should make 3 attempts");

    Ok(())
}

/// Test: Only server errors and throttling are worth retrying
#[test]
fn test_retryable_status_classification() {
    assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
    assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
    assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
    assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    assert!(!is_retryable_status(StatusCode::UNAUTHORIZED));
    assert!(!is_retryable_status(StatusCode::NOT_FOUND));
}
