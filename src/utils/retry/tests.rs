use super::*;

#[test]
fn default_policy_matches_documented_defaults() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.base_delay, Duration::from_millis(10));
    assert_eq!(policy.max_delay, Duration::from_secs(2));
    assert_eq!(policy.max_retries, 10);
}

#[test]
fn saga_command_policy_caps_higher_than_default() {
    let policy = RetryPolicy::for_saga_commands();
    assert_eq!(policy.max_delay, Duration::from_secs(60));
    assert_eq!(policy.max_retries, 10);
}

#[tokio::test]
async fn backoff_retries_until_success() {
    use backon::Retryable;
    use std::sync::atomic::{AtomicU32, Ordering};

    let policy = RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_retries: 5,
    };

    let attempts = AtomicU32::new(0);
    let result = (|| async {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
            Err("not yet")
        } else {
            Ok(n)
        }
    })
    .retry(policy.backoff())
    .await;

    assert_eq!(result.unwrap(), 2);
}

#[tokio::test]
async fn backoff_gives_up_after_max_retries() {
    use backon::Retryable;

    let policy = RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        max_retries: 2,
    };

    let result: Result<(), &str> = (|| async { Err("always fails") }).retry(policy.backoff()).await;

    assert!(result.is_err());
}
