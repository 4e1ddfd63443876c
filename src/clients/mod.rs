// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

pub mod retry;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

//
// StoreError
//

// Failure taxonomy of the transport. Recoverable errors are retried by the backoff engine until
// they succeed, turn permanent, or the send is aborted; anything else terminates the batch.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
  #[error("recoverable remote write error: {error}")]
  Recoverable {
    error: anyhow::Error,
    // A server-supplied minimum delay before the next attempt. None means the local backoff
    // schedule applies.
    retry_after: Option<Duration>,
  },
  #[error("permanent remote write error: {0}")]
  Permanent(anyhow::Error),
  #[error("remote write aborted by shutdown")]
  Aborted,
}

impl StoreError {
  pub fn recoverable(error: impl Into<anyhow::Error>) -> Self {
    Self::Recoverable {
      error: error.into(),
      retry_after: None,
    }
  }

  pub fn recoverable_after(error: impl Into<anyhow::Error>, retry_after: Duration) -> Self {
    Self::Recoverable {
      error: error.into(),
      retry_after: Some(retry_after),
    }
  }

  pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
    Self::Permanent(error.into())
  }
}

//
// WriteClient
//

/// A thin client wrapper used for mocking in tests. Implementations post the compressed
/// WriteRequest to a remote write capable endpoint and classify the response into the
/// [StoreError] taxonomy.
#[mockall::automock]
#[async_trait]
pub trait WriteClient: Send + Sync {
  async fn store(&self, compressed_write_request: Bytes) -> Result<(), StoreError>;

  // Uniquely identifies the remote in logs and metrics.
  fn name(&self) -> &str;

  fn endpoint(&self) -> &str;
}

//
// ClientHandle
//

// The swappable transport slot. Sends read the current client on every attempt; a live config
// reload that only touches client level settings replaces it without restarting the queue.
pub struct ClientHandle {
  inner: RwLock<Arc<dyn WriteClient>>,
}

impl ClientHandle {
  pub fn new(client: Arc<dyn WriteClient>) -> Self {
    Self {
      inner: RwLock::new(client),
    }
  }

  pub fn current(&self) -> Arc<dyn WriteClient> {
    self.inner.read().clone()
  }

  pub fn replace(&self, client: Arc<dyn WriteClient>) {
    *self.inner.write() = client;
  }
}
