// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::retry::{retry_call, RetryOptions};
use crate::{Error, TokenProvider};

struct RefreshCounter {
    refreshes: AtomicUsize,
}

impl RefreshCounter {
    fn new() -> Arc<RefreshCounter> {
        Arc::new(RefreshCounter {
            refreshes: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TokenProvider for RefreshCounter {
    async fn current_token(&self) -> Result<String, Error> {
        Ok("token".to_owned())
    }

    async fn refresh(&self) -> Result<String, Error> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok("fresh-token".to_owned())
    }
}

fn fast_options() -> RetryOptions {
    RetryOptions {
        max_retries: 3,
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(5),
    }
}

#[tokio::test]
async fn transient_errors_are_retried() {
    let tokens = RefreshCounter::new();
    let attempts = AtomicUsize::new(0);

    let value = retry_call(fast_options(), tokens.as_ref(), |_| {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            if n < 2 {
                Err(Error::Transient("flaky".to_owned()))
            } else {
                Ok(42)
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, 42);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn retries_are_exhausted() {
    let tokens = RefreshCounter::new();
    let attempts = AtomicUsize::new(0);

    let result: Result<(), Error> = retry_call(fast_options(), tokens.as_ref(), |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::Transient("still flaky".to_owned())) }
    })
    .await;

    assert_eq!(
        result,
        Err(Error::Transient("still flaky".to_owned()))
    );
    // The initial attempt plus max_retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn fatal_errors_propagate_immediately() {
    let tokens = RefreshCounter::new();
    let attempts = AtomicUsize::new(0);

    let result: Result<(), Error> = retry_call(fast_options(), tokens.as_ref(), |_| {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err(Error::Protocol("broken".to_owned())) }
    })
    .await;

    assert!(matches!(result, Err(Error::Protocol(_))));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn auth_expiry_refreshes_once_then_succeeds() {
    let tokens = RefreshCounter::new();
    let attempts = AtomicUsize::new(0);

    let value = retry_call(fast_options(), tokens.as_ref(), |_| {
        let n = attempts.fetch_add(1, Ordering::SeqCst);
        async move {
            if n == 0 {
                Err(Error::AuthExpired("stale token".to_owned()))
            } else {
                Ok("hello")
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(value, "hello");
    assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn auth_expiry_after_refresh_is_fatal() {
    let tokens = RefreshCounter::new();

    let result: Result<(), Error> = retry_call(fast_options(), tokens.as_ref(), |_| async {
        Err(Error::AuthExpired("always stale".to_owned()))
    })
    .await;

    assert!(matches!(result, Err(Error::Auth(_))));
    assert_eq!(tokens.refreshes.load(Ordering::SeqCst), 1);
}
