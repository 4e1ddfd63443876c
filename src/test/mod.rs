// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

// Helpers shared by the queue tests.

use crate::clients::{ClientHandle, StoreError, WriteClient};
use crate::protos::prompb::WriteRequest;
use crate::queue::config::QueueConfig;
use crate::queue::rate::EwmaRate;
use crate::queue::series::{Label, LabelSet, RefSample, RefSeries};
use crate::queue::shards::SendContext;
use crate::queue::stats::QueueStats;
use crate::queue::SHARD_UPDATE_INTERVAL;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use prost::Message;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn decode_write_request(compressed: &[u8]) -> anyhow::Result<WriteRequest> {
  let decompressed = snap::raw::Decoder::new().decompress_vec(compressed)?;
  Ok(WriteRequest::decode(decompressed.as_slice())?)
}

//
// RecordingWriteClient
//

// A transport that records every decoded request and replies from a programmable script
// (defaulting to success once the script runs out). With hang set, store never resolves, which
// is how the hard shutdown path is exercised; the automock client cannot express that.
pub struct RecordingWriteClient {
  name: String,
  endpoint: String,
  requests: Mutex<Vec<WriteRequest>>,
  responses: Mutex<VecDeque<Result<(), StoreError>>>,
  hang: AtomicBool,
  calls_tx: mpsc::UnboundedSender<()>,
}

impl RecordingWriteClient {
  pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<()>) {
    let (calls_tx, calls_rx) = mpsc::unbounded_channel();
    (
      Arc::new(Self {
        name: "test".to_string(),
        endpoint: "http://localhost/api/v1/write".to_string(),
        requests: Mutex::new(Vec::new()),
        responses: Mutex::new(VecDeque::new()),
        hang: AtomicBool::new(false),
        calls_tx,
      }),
      calls_rx,
    )
  }

  pub fn respond_with(&self, responses: impl IntoIterator<Item = Result<(), StoreError>>) {
    self.responses.lock().extend(responses);
  }

  pub fn set_hang(&self, hang: bool) {
    self.hang.store(hang, Ordering::Relaxed);
  }

  pub fn requests(&self) -> Vec<WriteRequest> {
    self.requests.lock().clone()
  }
}

#[async_trait]
impl WriteClient for RecordingWriteClient {
  async fn store(&self, compressed_write_request: Bytes) -> Result<(), StoreError> {
    let decoded = decode_write_request(&compressed_write_request).expect("valid request body");
    self.requests.lock().push(decoded);
    let _ = self.calls_tx.send(());

    if self.hang.load(Ordering::Relaxed) {
      futures::future::pending::<()>().await;
    }
    self.responses.lock().pop_front().unwrap_or(Ok(()))
  }

  fn name(&self) -> &str {
    &self.name
  }

  fn endpoint(&self) -> &str {
    &self.endpoint
  }
}

// Wait until the client has been called n more times, bounded so a broken test fails instead of
// hanging.
pub async fn wait_for_calls(calls_rx: &mut mpsc::UnboundedReceiver<()>, n: usize) {
  tokio::time::timeout(Duration::from_secs(5), async {
    for _ in 0 .. n {
      calls_rx.recv().await.expect("call channel closed");
    }
  })
  .await
  .expect("timed out waiting for store calls");
}

#[must_use]
pub fn make_series(reference: u64, labels: &[(&str, &str)]) -> RefSeries {
  RefSeries {
    reference,
    labels: labels
      .iter()
      .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
      .collect(),
  }
}

#[must_use]
pub const fn make_sample(reference: u64, timestamp: i64, value: f64) -> RefSample {
  RefSample {
    reference,
    timestamp,
    value,
  }
}

#[must_use]
pub fn make_labels(name: &str) -> Arc<LabelSet> {
  Arc::new(vec![Label {
    name: Arc::from("__name__"),
    value: Arc::from(name),
  }])
}

// A send context detached from any queue manager, for driving the shard and metadata paths
// directly.
pub(crate) fn make_send_context(
  client: Arc<dyn WriteClient>,
  config: QueueConfig,
) -> Arc<SendContext> {
  Arc::new(SendContext {
    client: Arc::new(ClientHandle::new(client)),
    stats: Arc::new(
      QueueStats::new(None, "test", "http://localhost/api/v1/write").expect("valid metric opts"),
    ),
    config,
    samples_out: EwmaRate::new(0.2, SHARD_UPDATE_INTERVAL),
    samples_out_duration: EwmaRate::new(0.2, SHARD_UPDATE_INTERVAL),
    last_send_timestamp: Arc::new(AtomicI64::new(0)),
  })
}
