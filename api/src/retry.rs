// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::{Error, TokenProvider};

#[derive(Clone, Copy, Debug)]
pub struct RetryOptions {
    /// Retries per call, beyond the initial attempt.
    pub max_retries: usize,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryOptions {
    fn default() -> RetryOptions {
        RetryOptions {
            max_retries: 3,
            backoff_base: Duration::from_millis(250),
            backoff_cap: Duration::from_secs(10),
        }
    }
}

///
/// Retry an idempotent operation using exponential back-off to delay between attempts.
///
/// Classification drives control flow: `Transient` errors are retried up to
/// `options.max_retries` times; the first `AuthExpired` triggers one token refresh via the
/// provider's hook and does not consume an attempt; every other error propagates immediately.
///
pub async fn retry_call<T, F, Fut>(
    options: RetryOptions,
    tokens: &dyn TokenProvider,
    f: F,
) -> Result<T, Error>
where
    F: Fn(usize) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let mut refreshed = false;
    let mut last_error: Option<Error> = None;

    let mut attempt = 0;
    while attempt <= options.max_retries {
        // Delay before the next send attempt if this is a retry.
        if attempt > 0 {
            let exp = 2_u32.saturating_pow(attempt.min(16) as u32);
            let multiplier = rand::rng().random_range(0..exp + 1);
            let sleep_time = (options.backoff_base * multiplier).min(options.backoff_cap);
            tokio::time::sleep(sleep_time).await;
        }

        match f(attempt).await {
            Ok(value) => return Ok(value),
            Err(Error::AuthExpired(message)) => {
                if refreshed {
                    return Err(Error::Auth(format!(
                        "The refreshed token was also rejected: {message}"
                    )));
                }
                log::debug!("Access token rejected; invoking refresh: {message}");
                let _ = tokens.refresh().await?;
                refreshed = true;
            }
            Err(err) if err.is_retryable() => {
                log::debug!("Attempt {attempt} failed: {err}");
                last_error = Some(err);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }

    // The loop only exhausts after storing at least one transient error.
    Err(last_error.take().unwrap())
}
