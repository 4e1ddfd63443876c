// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./shards_test.rs"]
mod shards_test;

use crate::clients::retry::{retry_with_backoff, BackoffPolicy};
use crate::clients::{ClientHandle, StoreError};
use crate::protos::prompb::{Label, TimeSeries};
use crate::protos::{allocate_timeseries, build_write_request};
use crate::queue::config::QueueConfig;
use crate::queue::rate::EwmaRate;
use crate::queue::series::LabelSet;
use crate::queue::stats::QueueStats;
use crate::queue::unix_now_seconds;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// A sample in flight between Append and a shard worker, carrying its interned labels.
pub(crate) struct PendingSample {
  pub labels: Arc<LabelSet>,
  pub timestamp: i64,
  pub value: f64,
}

// The narrow slice of queue manager state the send path needs: the swappable client, the metric
// set, the sharding rate meters, and the config snapshot.
pub(crate) struct SendContext {
  pub client: Arc<ClientHandle>,
  pub stats: Arc<QueueStats>,
  pub config: QueueConfig,
  pub samples_out: EwmaRate,
  pub samples_out_duration: EwmaRate,
  pub last_send_timestamp: Arc<AtomicI64>,
}

impl SendContext {
  pub fn backoff_policy(&self) -> BackoffPolicy {
    BackoffPolicy {
      min_backoff: self.config.min_backoff,
      max_backoff: self.config.max_backoff,
    }
  }
}

//
// Shards
//

// One epoch of the shard set: the senders feeding each worker plus the two shutdown stages.
// Dropping the senders is what closes the queues, so they live here and nowhere else.
struct RunningShards {
  senders: Vec<mpsc::Sender<PendingSample>>,
  // Refuses new enqueues while the epoch drains.
  soft_shutdown: CancellationToken,
  // Aborts in-flight sends once the flush deadline has passed.
  hard_shutdown: CancellationToken,
  workers: Vec<JoinHandle<()>>,
  dropped_on_hard_shutdown: Arc<AtomicU64>,
}

// The fan of per shard queues and their workers. enqueue takes the read lock and stop takes the
// write lock only after soft shutdown has unblocked every enqueue, so the two never deadlock.
pub(crate) struct Shards {
  context: Arc<SendContext>,
  state: RwLock<Option<RunningShards>>,
  dropped_on_hard_shutdown_total: AtomicU64,
}

impl Shards {
  pub fn new(context: Arc<SendContext>) -> Self {
    Self {
      context,
      state: RwLock::new(None),
      dropped_on_hard_shutdown_total: AtomicU64::new(0),
    }
  }

  // Samples lost to hard shutdowns across all epochs.
  pub fn dropped_on_hard_shutdown(&self) -> u64 {
    self.dropped_on_hard_shutdown_total.load(Ordering::Relaxed)
  }

  // Start a new epoch with n shards; must be called before any enqueue.
  pub fn start(&self, n: usize) {
    let mut state = self.state.write();
    debug_assert!(state.is_none(), "previous epoch still running");

    self.context.stats.pending_samples.set(0);
    self.context.stats.num_shards.set(n as i64);

    let soft_shutdown = CancellationToken::new();
    let hard_shutdown = CancellationToken::new();
    let dropped_on_hard_shutdown = Arc::new(AtomicU64::new(0));
    let mut senders = Vec::with_capacity(n);
    let mut workers = Vec::with_capacity(n);
    for shard_id in 0 .. n {
      let (tx, rx) = mpsc::channel(self.context.config.capacity);
      senders.push(tx);
      workers.push(tokio::spawn(run_shard(
        self.context.clone(),
        shard_id,
        rx,
        hard_shutdown.clone(),
        dropped_on_hard_shutdown.clone(),
      )));
    }

    *state = Some(RunningShards {
      senders,
      soft_shutdown,
      hard_shutdown,
      workers,
      dropped_on_hard_shutdown,
    });
  }

  // Queue a sample on its shard. Returns false when the shard's queue is full or the epoch is
  // shutting down or being replaced; the caller backs off and retries.
  pub fn enqueue(&self, reference: u64, sample: PendingSample) -> bool {
    let state = self.state.read();
    let Some(running) = state.as_ref() else {
      return false;
    };
    if running.soft_shutdown.is_cancelled() {
      return false;
    }

    let shard = (reference % running.senders.len() as u64) as usize;
    match running.senders[shard].try_send(sample) {
      Ok(()) => {
        self.context.stats.pending_samples.inc();
        true
      },
      Err(_) => false,
    }
  }

  // Stop the epoch. Drains through the flush deadline, then hard-cancels whatever is left.
  // Subsequent enqueues return false until the next start.
  pub async fn stop(&self, flush_deadline: Duration) {
    // Soft shutdown under the read lock: enqueue may be blocked on the write side of queues that
    // workers are no longer draining quickly, and it must observe the refusal before we take the
    // write lock below.
    {
      let state = self.state.read();
      let Some(running) = state.as_ref() else {
        return;
      };
      running.soft_shutdown.cancel();
    }

    let Some(running) = self.state.write().take() else {
      return;
    };
    let RunningShards {
      senders,
      hard_shutdown,
      workers,
      dropped_on_hard_shutdown,
      ..
    } = running;

    // Closing the queues lets each worker drain, flush and exit.
    drop(senders);

    let mut all_exited = Box::pin(futures::future::join_all(workers));
    if tokio::time::timeout(flush_deadline, &mut all_exited)
      .await
      .is_err()
    {
      // Force an unclean shutdown.
      hard_shutdown.cancel();
      all_exited.await;
    }

    let dropped = dropped_on_hard_shutdown.load(Ordering::Relaxed);
    if dropped > 0 {
      self
        .dropped_on_hard_shutdown_total
        .fetch_add(dropped, Ordering::Relaxed);
      log::error!("failed to flush all samples on shutdown, dropped {dropped}");
    }
  }
}

// One shard worker: accumulate into preallocated batch slots, flush on a full batch, on the batch
// deadline, or on drain; on hard shutdown drop everything still buffered or queued.
async fn run_shard(
  context: Arc<SendContext>,
  shard_id: usize,
  mut queue: mpsc::Receiver<PendingSample>,
  hard_shutdown: CancellationToken,
  dropped_on_hard_shutdown: Arc<AtomicU64>,
) {
  let max_samples = context.config.max_samples_per_send;
  let mut pending = allocate_timeseries(max_samples);
  let mut n_pending = 0;
  let mut scratch = Vec::new();

  let mut deadline = tokio::time::interval_at(
    tokio::time::Instant::now() + context.config.batch_send_deadline,
    context.config.batch_send_deadline,
  );
  deadline.set_missed_tick_behavior(MissedTickBehavior::Delay);

  loop {
    tokio::select! {
      () = hard_shutdown.cancelled() => {
        // Drop everything buffered and queued, count it as failed.
        let mut dropped = n_pending;
        while queue.try_recv().is_ok() {
          dropped += 1;
        }
        context.stats.pending_samples.sub(dropped as i64);
        context.stats.samples_failed_total.inc_by(dropped as u64);
        dropped_on_hard_shutdown.fetch_add(dropped as u64, Ordering::Relaxed);
        return;
      },
      received = queue.recv() => {
        let Some(sample) = received else {
          // The queue was closed for a clean shutdown; flush what is left and exit.
          if n_pending > 0 {
            log::debug!("flushing {n_pending} sample(s) on shard {shard_id} shutdown");
            send_samples(
              &context,
              &hard_shutdown,
              &pending[.. n_pending],
              &mut scratch,
              &dropped_on_hard_shutdown,
            )
            .await;
            context.stats.pending_samples.sub(n_pending as i64);
          }
          return;
        };

        // The send path retries endlessly, so a full slot array stops queue reads rather than
        // ever growing; indexing by n_pending is safe.
        let slot = &mut pending[n_pending];
        slot.labels.clear();
        slot.labels.extend(sample.labels.iter().map(|label| Label {
          name: label.name.to_string(),
          value: label.value.to_string(),
        }));
        slot.samples[0].timestamp = sample.timestamp;
        slot.samples[0].value = sample.value;
        n_pending += 1;

        if n_pending == max_samples {
          send_samples(
            &context,
            &hard_shutdown,
            &pending,
            &mut scratch,
            &dropped_on_hard_shutdown,
          )
          .await;
          context.stats.pending_samples.sub(max_samples as i64);
          n_pending = 0;
          deadline.reset();
        }
      },
      _ = deadline.tick() => {
        if n_pending > 0 {
          log::debug!("batch deadline elapsed, sending {n_pending} sample(s) on shard {shard_id}");
          send_samples(
            &context,
            &hard_shutdown,
            &pending[.. n_pending],
            &mut scratch,
            &dropped_on_hard_shutdown,
          )
          .await;
          context.stats.pending_samples.sub(n_pending as i64);
          n_pending = 0;
        }
      },
    }
  }
}

// Send one batch, absorbing errors into counters. A batch aborted by hard shutdown counts as
// dropped on hard shutdown as well as failed. The sharding meters are maintained whether or not
// the send succeeded.
async fn send_samples(
  context: &SendContext,
  hard_shutdown: &CancellationToken,
  samples: &[TimeSeries],
  scratch: &mut Vec<u8>,
  dropped_on_hard_shutdown: &AtomicU64,
) {
  let begin = Instant::now();
  if let Err(e) = send_samples_with_backoff(context, hard_shutdown, samples, scratch).await {
    log::error!("non-recoverable error sending {} sample(s): {e}", samples.len());
    context
      .stats
      .samples_failed_total
      .inc_by(samples.len() as u64);
    if matches!(e, StoreError::Aborted) {
      dropped_on_hard_shutdown.fetch_add(samples.len() as u64, Ordering::Relaxed);
    }
  }

  context.samples_out.incr(samples.len() as i64);
  context
    .samples_out_duration
    .incr(begin.elapsed().as_nanos() as i64);
  context
    .last_send_timestamp
    .store(unix_now_seconds(), Ordering::Relaxed);
}

async fn send_samples_with_backoff(
  context: &SendContext,
  hard_shutdown: &CancellationToken,
  samples: &[TimeSeries],
  scratch: &mut Vec<u8>,
) -> Result<(), StoreError> {
  let request = build_write_request(samples, &[], scratch);
  let sample_count = samples.len() as u64;

  retry_with_backoff(
    context.backoff_policy(),
    hard_shutdown,
    |try_count| {
      let client = context.client.current();
      let compressed = request.compressed.clone();
      let stats = context.stats.clone();
      async move {
        log::debug!("sending batch of {sample_count} sample(s), try {try_count}");
        let begin = Instant::now();
        let result = client.store(compressed).await;
        stats.sent_batch_duration.observe(begin.elapsed().as_secs_f64());
        result
      }
    },
    || {
      context.stats.samples_retried_total.inc_by(sample_count);
    },
  )
  .await?;

  context.stats.samples_total.inc_by(sample_count);
  context
    .stats
    .samples_bytes_total
    .inc_by(request.uncompressed_len as u64);
  context
    .stats
    .highest_sent_timestamp
    .set(request.highest_timestamp as f64 / 1000.0);
  Ok(())
}
