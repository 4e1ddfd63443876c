// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./stats_test.rs"]
mod stats_test;

use parking_lot::Mutex;
use prometheus::core::Collector;
use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry};
use std::collections::HashMap;
use std::sync::Arc;

const NAMESPACE: &str = "remote";
const SUBSYSTEM: &str = "write";

//
// MaxTimestampGauge
//

// A gauge that only ever moves forward. Multiple shard workers race to publish the highest sent
// timestamp; whichever holds the max wins and later, lower observations are ignored.
pub struct MaxTimestampGauge {
  value: Mutex<f64>,
  gauge: Gauge,
}

impl MaxTimestampGauge {
  fn new(gauge: Gauge) -> Arc<Self> {
    Arc::new(Self {
      value: Mutex::new(0.0),
      gauge,
    })
  }

  pub fn set(&self, v: f64) {
    let mut value = self.value.lock();
    if v > *value {
      *value = v;
      self.gauge.set(v);
    }
  }

  pub fn get(&self) -> f64 {
    *self.value.lock()
  }
}

//
// QueueStats
//

// The metric set for one remote write queue, one series per {remote_name, endpoint}.
pub struct QueueStats {
  registry: Option<Registry>,

  pub samples_total: IntCounter,
  pub metadata_total: IntCounter,
  pub samples_failed_total: IntCounter,
  pub metadata_failed_total: IntCounter,
  pub samples_retried_total: IntCounter,
  pub metadata_retried_total: IntCounter,
  pub samples_dropped_total: IntCounter,
  pub enqueue_retries_total: IntCounter,
  pub sent_batch_duration: Histogram,
  pub highest_sent_timestamp: Arc<MaxTimestampGauge>,
  // Highest timestamp observed at ingest. The storage layer owns exporting this one, so it is
  // not part of register().
  pub highest_recv_timestamp: Arc<MaxTimestampGauge>,
  pub pending_samples: IntGauge,
  pub shard_capacity: IntGauge,
  pub num_shards: IntGauge,
  pub max_num_shards: IntGauge,
  pub min_num_shards: IntGauge,
  pub desired_num_shards: Gauge,
  pub samples_bytes_total: IntCounter,
  pub metadata_bytes_total: IntCounter,
  pub max_samples_per_send: IntGauge,
}

impl QueueStats {
  pub fn new(
    registry: Option<Registry>,
    remote_name: &str,
    endpoint: &str,
  ) -> anyhow::Result<Self> {
    let const_labels = HashMap::from([
      ("remote_name".to_string(), remote_name.to_string()),
      ("endpoint".to_string(), endpoint.to_string()),
    ]);
    let opts = |name: &str, help: &str| {
      Opts::new(name, help)
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM)
        .const_labels(const_labels.clone())
    };

    let mut batch_duration_buckets = prometheus::DEFAULT_BUCKETS.to_vec();
    batch_duration_buckets.extend([25.0, 60.0, 120.0, 300.0]);

    Ok(Self {
      registry,
      samples_total: IntCounter::with_opts(opts(
        "samples_total",
        "Total number of samples sent to remote storage.",
      ))?,
      metadata_total: IntCounter::with_opts(opts(
        "metadata_total",
        "Total number of metadata entries sent to remote storage.",
      ))?,
      samples_failed_total: IntCounter::with_opts(opts(
        "samples_failed_total",
        "Total number of samples which failed on send to remote storage, non-recoverable errors.",
      ))?,
      metadata_failed_total: IntCounter::with_opts(opts(
        "metadata_failed_total",
        "Total number of metadata entries which failed on send to remote storage, \
         non-recoverable errors.",
      ))?,
      samples_retried_total: IntCounter::with_opts(opts(
        "samples_retried_total",
        "Total number of samples which failed on send to remote storage but were retried because \
         the send error was recoverable.",
      ))?,
      metadata_retried_total: IntCounter::with_opts(opts(
        "metadata_retried_total",
        "Total number of metadata entries which failed on send to remote storage but were \
         retried because the send error was recoverable.",
      ))?,
      samples_dropped_total: IntCounter::with_opts(opts(
        "samples_dropped_total",
        "Total number of samples which were dropped after being read from the WAL before being \
         sent via remote write.",
      ))?,
      enqueue_retries_total: IntCounter::with_opts(opts(
        "enqueue_retries_total",
        "Total number of times enqueue has failed because a shards queue was full.",
      ))?,
      sent_batch_duration: Histogram::with_opts(
        HistogramOpts::new(
          "sent_batch_duration_seconds",
          "Duration of send calls to the remote storage.",
        )
        .namespace(NAMESPACE)
        .subsystem(SUBSYSTEM)
        .const_labels(const_labels.clone())
        .buckets(batch_duration_buckets),
      )?,
      highest_sent_timestamp: MaxTimestampGauge::new(Gauge::with_opts(opts(
        "queue_highest_sent_timestamp_seconds",
        "Timestamp from a WAL sample, the highest timestamp successfully sent by this queue, in \
         seconds since epoch.",
      ))?),
      highest_recv_timestamp: MaxTimestampGauge::new(Gauge::with_opts(opts(
        "highest_timestamp_in_seconds",
        "Highest timestamp that has come into the remote storage via the Append interface, in \
         seconds since epoch.",
      ))?),
      pending_samples: IntGauge::with_opts(opts(
        "samples_pending",
        "The number of samples pending in the queues shards to be sent to the remote storage.",
      ))?,
      shard_capacity: IntGauge::with_opts(opts(
        "shard_capacity",
        "The capacity of each shard of the queue used for parallel sending to the remote \
         storage.",
      ))?,
      num_shards: IntGauge::with_opts(opts(
        "shards",
        "The number of shards used for parallel sending to the remote storage.",
      ))?,
      max_num_shards: IntGauge::with_opts(opts(
        "shards_max",
        "The maximum number of shards that the queue is allowed to run.",
      ))?,
      min_num_shards: IntGauge::with_opts(opts(
        "shards_min",
        "The minimum number of shards that the queue is allowed to run.",
      ))?,
      desired_num_shards: Gauge::with_opts(opts(
        "shards_desired",
        "The number of shards that the queues shard calculation wants to run based on the rate \
         of samples in vs. samples out.",
      ))?,
      samples_bytes_total: IntCounter::with_opts(opts(
        "samples_bytes_total",
        "The total number of uncompressed bytes of samples sent by the queue.",
      ))?,
      metadata_bytes_total: IntCounter::with_opts(opts(
        "metadata_bytes_total",
        "The total number of bytes of metadata sent by the queue after compression.",
      ))?,
      max_samples_per_send: IntGauge::with_opts(opts(
        "max_samples_per_send",
        "The maximum number of samples to be sent, in a single request, to the remote storage.",
      ))?,
    })
  }

  fn collectors(&self) -> Vec<Box<dyn Collector>> {
    vec![
      Box::new(self.samples_total.clone()),
      Box::new(self.metadata_total.clone()),
      Box::new(self.samples_failed_total.clone()),
      Box::new(self.metadata_failed_total.clone()),
      Box::new(self.samples_retried_total.clone()),
      Box::new(self.metadata_retried_total.clone()),
      Box::new(self.samples_dropped_total.clone()),
      Box::new(self.enqueue_retries_total.clone()),
      Box::new(self.sent_batch_duration.clone()),
      Box::new(self.highest_sent_timestamp.gauge.clone()),
      Box::new(self.pending_samples.clone()),
      Box::new(self.shard_capacity.clone()),
      Box::new(self.num_shards.clone()),
      Box::new(self.max_num_shards.clone()),
      Box::new(self.min_num_shards.clone()),
      Box::new(self.desired_num_shards.clone()),
      Box::new(self.samples_bytes_total.clone()),
      Box::new(self.metadata_bytes_total.clone()),
      Box::new(self.max_samples_per_send.clone()),
    ]
  }

  pub fn register(&self) -> anyhow::Result<()> {
    if let Some(registry) = &self.registry {
      for collector in self.collectors() {
        registry.register(collector)?;
      }
    }
    Ok(())
  }

  pub fn unregister(&self) {
    if let Some(registry) = &self.registry {
      for collector in self.collectors() {
        let _ = registry.unregister(collector);
      }
    }
  }
}
