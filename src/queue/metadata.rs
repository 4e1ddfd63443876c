// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./metadata_test.rs"]
mod metadata_test;

use crate::clients::retry::retry_with_backoff;
use crate::protos::build_write_request;
use crate::protos::prompb;
use crate::queue::shards::SendContext;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// The shape of a scrape metadata catalog entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetadataEntry {
  pub metric_family_name: String,
  pub kind: MetricKind,
  pub help: String,
  pub unit: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
  Unknown,
  Counter,
  Gauge,
  Histogram,
  GaugeHistogram,
  Summary,
  Info,
  Stateset,
}

impl MetricKind {
  const fn to_proto(self) -> prompb::MetricType {
    match self {
      Self::Unknown => prompb::MetricType::Unknown,
      Self::Counter => prompb::MetricType::Counter,
      Self::Gauge => prompb::MetricType::Gauge,
      Self::Histogram => prompb::MetricType::Histogram,
      Self::GaugeHistogram => prompb::MetricType::GaugeHistogram,
      Self::Summary => prompb::MetricType::Summary,
      Self::Info => prompb::MetricType::Info,
      Self::Stateset => prompb::MetricType::Stateset,
    }
  }
}

/// The scrape manager's metadata catalog, snapshotted once per send interval.
#[cfg_attr(test, mockall::automock)]
pub trait MetadataSource: Send + Sync {
  fn metadata(&self) -> Vec<MetadataEntry>;
}

// Periodically push the metadata catalog to the remote in a single unsharded request. A failed
// interval is logged and counted, never carried over; the next snapshot supersedes it.
pub(crate) async fn run_metadata_watcher(
  context: Arc<SendContext>,
  source: Arc<dyn MetadataSource>,
  send_interval: Duration,
  quit: CancellationToken,
) {
  let mut ticker = tokio::time::interval_at(
    tokio::time::Instant::now() + send_interval,
    send_interval,
  );
  ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      () = quit.cancelled() => return,
      _ = ticker.tick() => {
        let entries = source.metadata();
        if entries.is_empty() {
          continue;
        }
        send_metadata(&context, &quit, &entries).await;
      },
    }
  }
}

// Send one metadata snapshot through the backoff engine. Metadata requests carry no samples.
pub(crate) async fn send_metadata(
  context: &SendContext,
  quit: &CancellationToken,
  entries: &[MetadataEntry],
) {
  let metadata: Vec<prompb::MetricMetadata> = entries
    .iter()
    .map(|entry| prompb::MetricMetadata {
      r#type: entry.kind.to_proto() as i32,
      metric_family_name: entry.metric_family_name.clone(),
      help: entry.help.clone(),
      unit: entry.unit.clone(),
    })
    .collect();

  let mut scratch = Vec::new();
  let request = build_write_request(&[], &metadata, &mut scratch);
  let metadata_count = metadata.len() as u64;

  let result = retry_with_backoff(
    context.backoff_policy(),
    quit,
    |try_count| {
      let client = context.client.current();
      let compressed = request.compressed.clone();
      let stats = context.stats.clone();
      async move {
        log::debug!("sending {metadata_count} metadata entries, try {try_count}");
        let begin = Instant::now();
        let result = client.store(compressed).await;
        stats.sent_batch_duration.observe(begin.elapsed().as_secs_f64());
        result
      }
    },
    || {
      context
        .stats
        .metadata_retried_total
        .inc_by(metadata_count);
    },
  )
  .await;

  match result {
    Ok(()) => {
      context.stats.metadata_total.inc_by(metadata_count);
      context
        .stats
        .metadata_bytes_total
        .inc_by(request.compressed.len() as u64);
    },
    Err(e) => {
      context.stats.metadata_failed_total.inc_by(metadata_count);
      log::error!("non-recoverable error sending {metadata_count} metadata entries: {e}");
    },
  }
}
