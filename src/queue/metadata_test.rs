// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use crate::clients::StoreError;
use crate::protos::prompb::MetricType;
use crate::queue::config::QueueConfig;
use crate::test::{make_send_context, wait_for_calls, RecordingWriteClient};
use anyhow::anyhow;
use pretty_assertions::assert_eq;

fn entries() -> Vec<MetadataEntry> {
  vec![
    MetadataEntry {
      metric_family_name: "http_requests".to_string(),
      kind: MetricKind::Counter,
      help: "Total requests.".to_string(),
      unit: String::new(),
    },
    MetadataEntry {
      metric_family_name: "queue_depth".to_string(),
      kind: MetricKind::Gauge,
      help: "Current depth.".to_string(),
      unit: String::new(),
    },
  ]
}

fn fast_config() -> QueueConfig {
  QueueConfig {
    min_backoff: Duration::from_millis(1),
    max_backoff: Duration::from_millis(5),
    ..Default::default()
  }
}

#[tokio::test]
async fn metadata_is_sent_in_one_unsharded_request() {
  let (client, _calls_rx) = RecordingWriteClient::new();
  let context = make_send_context(client.clone(), fast_config());

  send_metadata(&context, &CancellationToken::new(), &entries()).await;

  let requests = client.requests();
  assert_eq!(1, requests.len());
  assert!(requests[0].timeseries.is_empty());
  assert_eq!(2, requests[0].metadata.len());
  assert_eq!("http_requests", requests[0].metadata[0].metric_family_name);
  assert_eq!(MetricType::Counter as i32, requests[0].metadata[0].r#type);
  assert_eq!(MetricType::Gauge as i32, requests[0].metadata[1].r#type);

  assert_eq!(2, context.stats.metadata_total.get());
  assert!(context.stats.metadata_bytes_total.get() > 0);
  assert_eq!(0, context.stats.metadata_failed_total.get());
}

#[tokio::test]
async fn failed_metadata_is_counted_and_not_carried_over() {
  let (client, _calls_rx) = RecordingWriteClient::new();
  client.respond_with([Err(StoreError::permanent(anyhow!("http 400")))]);
  let context = make_send_context(client.clone(), fast_config());

  send_metadata(&context, &CancellationToken::new(), &entries()).await;

  assert_eq!(1, client.requests().len());
  assert_eq!(2, context.stats.metadata_failed_total.get());
  assert_eq!(0, context.stats.metadata_total.get());
  assert_eq!(0, context.stats.metadata_retried_total.get());
}

#[tokio::test]
async fn recoverable_metadata_errors_are_retried() {
  let (client, _calls_rx) = RecordingWriteClient::new();
  client.respond_with([Err(StoreError::recoverable(anyhow!("http 500"))), Ok(())]);
  let context = make_send_context(client.clone(), fast_config());

  send_metadata(&context, &CancellationToken::new(), &entries()).await;

  assert_eq!(2, client.requests().len());
  assert_eq!(2, context.stats.metadata_retried_total.get());
  assert_eq!(2, context.stats.metadata_total.get());
  assert_eq!(0, context.stats.metadata_failed_total.get());
}

#[tokio::test]
async fn watcher_snapshots_the_catalog_every_interval() {
  let (client, mut calls_rx) = RecordingWriteClient::new();
  let context = make_send_context(client.clone(), fast_config());

  let mut source = MockMetadataSource::new();
  source.expect_metadata().returning(entries);

  let quit = CancellationToken::new();
  let watcher = tokio::spawn(run_metadata_watcher(
    context.clone(),
    Arc::new(source),
    Duration::from_millis(50),
    quit.clone(),
  ));

  wait_for_calls(&mut calls_rx, 2).await;
  // Let the in-flight send finish its accounting before tearing the watcher down.
  tokio::time::sleep(Duration::from_millis(20)).await;
  quit.cancel();
  watcher.await.unwrap();

  assert!(client.requests().len() >= 2);
  assert!(context.stats.metadata_total.get() >= 2);
  assert!(client.requests()[0].timeseries.is_empty());
}

#[tokio::test]
async fn watcher_skips_an_empty_catalog() {
  let (client, _calls_rx) = RecordingWriteClient::new();
  let context = make_send_context(client.clone(), fast_config());

  let mut source = MockMetadataSource::new();
  source.expect_metadata().returning(Vec::new);

  let quit = CancellationToken::new();
  let watcher = tokio::spawn(run_metadata_watcher(
    context.clone(),
    Arc::new(source),
    Duration::from_millis(20),
    quit.clone(),
  ));

  tokio::time::sleep(Duration::from_millis(100)).await;
  quit.cancel();
  watcher.await.unwrap();

  assert!(client.requests().is_empty());
  assert_eq!(0, context.stats.metadata_total.get());
}

#[test]
fn metric_kinds_map_to_the_wire_enum() {
  assert_eq!(MetricType::Unknown, MetricKind::Unknown.to_proto());
  assert_eq!(MetricType::Counter, MetricKind::Counter.to_proto());
  assert_eq!(MetricType::Gauge, MetricKind::Gauge.to_proto());
  assert_eq!(MetricType::Histogram, MetricKind::Histogram.to_proto());
  assert_eq!(
    MetricType::GaugeHistogram,
    MetricKind::GaugeHistogram.to_proto()
  );
  assert_eq!(MetricType::Summary, MetricKind::Summary.to_proto());
  assert_eq!(MetricType::Info, MetricKind::Info.to_proto());
  assert_eq!(MetricType::Stateset, MetricKind::Stateset.to_proto());
}
