// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::bail;
use std::time::Duration;

//
// QueueConfig
//

// Tunables for one remote write queue. Defaults match what the queue was historically deployed
// with: enough headroom to ride out a multi-minute remote outage at moderate ingest rates.
#[derive(Clone, Debug)]
pub struct QueueConfig {
  // Per shard channel depth, in samples.
  pub capacity: usize,
  // Maximum number of samples per outgoing request.
  pub max_samples_per_send: usize,
  // A partial batch is flushed once it has been sitting for this long.
  pub batch_send_deadline: Duration,
  pub min_shards: usize,
  pub max_shards: usize,
  // Retry envelope for both enqueue backpressure and send retries.
  pub min_backoff: Duration,
  pub max_backoff: Duration,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      capacity: 2500,
      max_samples_per_send: 500,
      batch_send_deadline: Duration::from_secs(5),
      min_shards: 1,
      max_shards: 200,
      min_backoff: Duration::from_millis(30),
      max_backoff: Duration::from_secs(5),
    }
  }
}

impl QueueConfig {
  pub fn validate(&self) -> anyhow::Result<()> {
    if self.capacity == 0 {
      bail!("queue capacity must be positive");
    }
    if self.max_samples_per_send == 0 {
      bail!("max samples per send must be positive");
    }
    if self.min_shards == 0 {
      bail!("min shards must be positive");
    }
    if self.min_shards > self.max_shards {
      bail!(
        "min shards ({}) must not exceed max shards ({})",
        self.min_shards,
        self.max_shards
      );
    }
    if self.min_backoff > self.max_backoff {
      bail!("min backoff must not exceed max backoff");
    }
    Ok(())
  }
}

//
// MetadataConfig
//

#[derive(Clone, Debug)]
pub struct MetadataConfig {
  // Whether to periodically forward the scrape metadata catalog.
  pub send: bool,
  pub send_interval: Duration,
}

impl Default for MetadataConfig {
  fn default() -> Self {
    Self {
      send: true,
      send_interval: Duration::from_secs(60),
    }
  }
}

pub const DEFAULT_FLUSH_DEADLINE: Duration = Duration::from_secs(60);
