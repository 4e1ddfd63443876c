// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./retry_test.rs"]
mod retry_test;

use crate::clients::StoreError;
use futures::Future;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

//
// BackoffPolicy
//

// The retry envelope: delays double from min_backoff up to max_backoff.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
  pub min_backoff: Duration,
  pub max_backoff: Duration,
}

// Run an attempt under exponential backoff until it succeeds, fails permanently, or the abort
// token fires. There is no attempt cap. A recoverable error that carries a positive retry_after
// overrides the local delay for that round; the next local delay doubles from whichever delay was
// actually slept. Both the attempt future and the sleep are dropped the moment the abort token
// cancels, which is what aborts an in-flight request on hard shutdown.
pub async fn retry_with_backoff<F, Fut>(
  policy: BackoffPolicy,
  abort: &CancellationToken,
  mut attempt: F,
  mut on_retry: impl FnMut(),
) -> Result<(), StoreError>
where
  F: FnMut(usize) -> Fut,
  Fut: Future<Output = Result<(), StoreError>>,
{
  let mut backoff = policy.min_backoff;
  let mut try_count = 0;

  loop {
    if abort.is_cancelled() {
      return Err(StoreError::Aborted);
    }

    let result = tokio::select! {
      () = abort.cancelled() => return Err(StoreError::Aborted),
      result = attempt(try_count) => result,
    };

    let error = match result {
      Ok(()) => return Ok(()),
      Err(e @ StoreError::Recoverable { .. }) => e,
      Err(e) => return Err(e),
    };

    let sleep_duration = match &error {
      StoreError::Recoverable {
        retry_after: Some(retry_after),
        ..
      } if !retry_after.is_zero() => {
        log::info!("retrying after duration specified by Retry-After: {retry_after:?}");
        *retry_after
      },
      _ => backoff,
    };

    tokio::select! {
      () = abort.cancelled() => return Err(StoreError::Aborted),
      () = sleep(sleep_duration) => {},
    }

    on_retry();
    log::warn!("failed to send batch, retrying: {error}");

    backoff = (sleep_duration * 2).min(policy.max_backoff);
    try_count += 1;
  }
}
