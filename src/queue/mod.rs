// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod config;
pub mod interner;
pub mod metadata;
pub mod rate;
pub mod series;
pub mod shards;
pub mod stats;

use self::config::{MetadataConfig, QueueConfig};
use self::interner::Interner;
use self::metadata::{run_metadata_watcher, MetadataSource};
use self::rate::EwmaRate;
use self::series::{RefSample, RefSeries, RelabelFn, SeriesTable};
use self::shards::{PendingSample, SendContext, Shards};
use self::stats::QueueStats;
use crate::clients::{ClientHandle, WriteClient};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

// Samples in/out and push latency are smoothed with an EWMA over the shard update interval.
const EWMA_WEIGHT: f64 = 0.2;
pub(crate) const SHARD_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

// Allow 30% too many shards before scaling down.
const SHARD_TOLERANCE_FRACTION: f64 = 0.3;

pub(crate) fn unix_now_seconds() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs() as i64
}

//
// WalIngest
//

/// The surface the WAL watcher drives. Series records install label sets, samples ride the
/// sharded queues, and checkpoints garbage collect the series table.
#[async_trait]
pub trait WalIngest: Send + Sync {
  /// Queue samples for sending. Blocks until every sample is enqueued on its shard or shutdown
  /// is signalled; false means the remainder was dropped due to shutdown.
  async fn append(&self, samples: &[RefSample]) -> bool;

  /// Install the label sets for series seen in `segment`. Idempotent.
  fn store_series(&self, series: &[RefSeries], segment: u32);

  /// Refresh only the segment index for series re-read out of a checkpoint.
  fn update_series_segment(&self, series: &[RefSeries], segment: u32);

  /// Evict every series last seen before `checkpoint_segment`.
  fn series_reset(&self, checkpoint_segment: u32);
}

//
// QueueManager
//

// Tails samples handed over by the WAL watcher and forwards them to one remote write endpoint
// with bounded memory and adaptive parallelism. Owns the series table, the interner, the shard
// set, and the control and reshard loops.
pub struct QueueManager {
  flush_deadline: Duration,
  metadata_config: MetadataConfig,
  external_labels: Vec<(String, String)>,
  relabel: Option<RelabelFn>,

  context: Arc<SendContext>,
  interner: Arc<Interner>,
  series: Mutex<SeriesTable>,
  shards: Arc<Shards>,

  samples_in: EwmaRate,
  samples_dropped: EwmaRate,

  quit: CancellationToken,
  reshard_tx: mpsc::Sender<usize>,
  reshard_rx: Mutex<Option<mpsc::Receiver<usize>>>,
  metadata_source: Option<Arc<dyn MetadataSource>>,
  tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueManager {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    registry: Option<prometheus::Registry>,
    config: QueueConfig,
    metadata_config: MetadataConfig,
    mut external_labels: Vec<(String, String)>,
    relabel: Option<RelabelFn>,
    client: Arc<dyn WriteClient>,
    flush_deadline: Duration,
    metadata_source: Option<Arc<dyn MetadataSource>>,
  ) -> anyhow::Result<Arc<Self>> {
    config.validate()?;
    external_labels.sort();

    let stats = Arc::new(QueueStats::new(registry, client.name(), client.endpoint())?);
    let context = Arc::new(SendContext {
      client: Arc::new(ClientHandle::new(client)),
      stats,
      config,
      samples_out: EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
      samples_out_duration: EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
      last_send_timestamp: Arc::new(AtomicI64::new(0)),
    });
    let (reshard_tx, reshard_rx) = mpsc::channel(1);

    Ok(Arc::new(Self {
      flush_deadline,
      metadata_config,
      external_labels,
      relabel,
      shards: Arc::new(Shards::new(context.clone())),
      context,
      interner: Arc::new(Interner::default()),
      series: Mutex::new(SeriesTable::default()),
      samples_in: EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
      samples_dropped: EwmaRate::new(EWMA_WEIGHT, SHARD_UPDATE_INTERVAL),
      quit: CancellationToken::new(),
      reshard_tx,
      reshard_rx: Mutex::new(Some(reshard_rx)),
      metadata_source,
      tasks: Mutex::new(Vec::new()),
    }))
  }

  fn config(&self) -> &QueueConfig {
    &self.context.config
  }

  pub fn stats(&self) -> &QueueStats {
    &self.context.stats
  }

  // Start sending samples to the remote. Does not block.
  pub fn start(self: &Arc<Self>) {
    let Some(reshard_rx) = self.reshard_rx.lock().take() else {
      log::warn!("queue manager already started");
      return;
    };

    let stats = &self.context.stats;
    if let Err(e) = stats.register() {
      log::warn!("failed to register remote write metrics: {e}");
    }
    let config = self.config();
    stats.shard_capacity.set(config.capacity as i64);
    stats.max_num_shards.set(config.max_shards as i64);
    stats.min_num_shards.set(config.min_shards as i64);
    stats.desired_num_shards.set(config.min_shards as f64);
    stats
      .max_samples_per_send
      .set(config.max_samples_per_send as i64);

    self.shards.start(config.min_shards);

    let mut tasks = self.tasks.lock();
    tasks.push(tokio::spawn(self.clone().update_shards_loop()));
    tasks.push(tokio::spawn(self.clone().reshard_loop(reshard_rx)));
    if self.metadata_config.send {
      if let Some(source) = &self.metadata_source {
        tasks.push(tokio::spawn(run_metadata_watcher(
          self.context.clone(),
          source.clone(),
          self.metadata_config.send_interval,
          self.quit.clone(),
        )));
      }
    }
  }

  // Stop sending and wait for pending sends, through the flush deadline at most.
  pub async fn stop(&self) {
    log::info!("stopping remote write queue...");
    self.quit.cancel();

    // The loops must be joined before the shards stop so a reshard cannot race the shutdown.
    let tasks = std::mem::take(&mut *self.tasks.lock());
    for task in tasks {
      let _ = task.await;
    }
    self.shards.stop(self.flush_deadline).await;

    // Release everything the series table still holds in the intern pool.
    self.series.lock().release_all(&self.interner);
    self.context.stats.unregister();
    log::info!("remote write queue stopped");
  }

  // Swap the transport without restarting the queue. Used when only client level settings
  // changed on a config reload.
  pub fn set_client(&self, client: Arc<dyn WriteClient>) {
    self.context.client.replace(client);
  }

  async fn update_shards_loop(self: Arc<Self>) {
    let mut ticker = tokio::time::interval_at(
      tokio::time::Instant::now() + SHARD_UPDATE_INTERVAL,
      SHARD_UPDATE_INTERVAL,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut num_shards = self.config().min_shards;

    loop {
      tokio::select! {
        () = self.quit.cancelled() => return,
        _ = ticker.tick() => {
          let desired_shards = self.calculate_desired_shards(num_shards);
          if !self.should_reshard(desired_shards, num_shards) {
            continue;
          }
          // Resharding can take a while; skip the tick rather than stall this loop.
          match self.reshard_tx.try_send(desired_shards) {
            Ok(()) => {
              log::info!("remote storage resharding from {num_shards} to {desired_shards}");
              num_shards = desired_shards;
            },
            Err(_) => log::info!("currently resharding, skipping"),
          }
        },
      }
    }
  }

  // Serializes epoch changes: the old shard set is fully stopped, and therefore completely
  // flushed, before the new one starts, so samples are only ever delivered in per series order.
  async fn reshard_loop(self: Arc<Self>, mut reshard_rx: mpsc::Receiver<usize>) {
    loop {
      tokio::select! {
        () = self.quit.cancelled() => return,
        received = reshard_rx.recv() => {
          let Some(num_shards) = received else {
            return;
          };
          self.shards.stop(self.flush_deadline).await;
          self.shards.start(num_shards);
        },
      }
    }
  }

  // Predict the shard count that keeps up with the incoming rate: incoming samples are the work
  // for the next interval, pending samples the backlog to catch up on, and the average send
  // latency converts both into shard time.
  fn calculate_desired_shards(&self, current_shards: usize) -> usize {
    self.samples_in.tick();
    self.context.samples_out.tick();
    self.samples_dropped.tick();
    self.context.samples_out_duration.tick();

    let samples_in_rate = self.samples_in.rate();
    let samples_out_rate = self.context.samples_out.rate();
    let samples_kept_ratio = samples_out_rate / (self.samples_dropped.rate() + samples_out_rate);
    let samples_out_duration = self.context.samples_out_duration.rate() / 1e9;
    let samples_pending_rate = samples_in_rate * samples_kept_ratio - samples_out_rate;
    let highest_sent = self.context.stats.highest_sent_timestamp.get();
    let highest_recv = self.context.stats.highest_recv_timestamp.get();
    let delay = highest_recv - highest_sent;
    let samples_pending = delay * samples_in_rate * samples_kept_ratio;

    if samples_out_rate <= 0.0 {
      return current_shards;
    }

    // Pending samples act like the error integral: each tick tries to work off a proportion of
    // the backlog on top of the steady state rate.
    let integral_gain = 0.1 / SHARD_UPDATE_INTERVAL.as_secs_f64();
    let time_per_sample = samples_out_duration / samples_out_rate;
    let desired_shards =
      time_per_sample * (samples_in_rate * samples_kept_ratio + integral_gain * samples_pending);
    self.context.stats.desired_num_shards.set(desired_shards);
    log::debug!(
      "calculate_desired_shards: samples_in_rate={samples_in_rate} \
       samples_out_rate={samples_out_rate} samples_kept_ratio={samples_kept_ratio} \
       samples_pending_rate={samples_pending_rate} samples_pending={samples_pending} \
       samples_out_duration={samples_out_duration} time_per_sample={time_per_sample} \
       desired_shards={desired_shards} highest_sent={highest_sent} highest_recv={highest_recv}"
    );

    // Changes smaller than the tolerance band are not worth an epoch change.
    let lower_bound = current_shards as f64 * (1.0 - SHARD_TOLERANCE_FRACTION);
    let upper_bound = current_shards as f64 * (1.0 + SHARD_TOLERANCE_FRACTION);
    if lower_bound <= desired_shards && desired_shards <= upper_bound {
      return current_shards;
    }

    let num_shards = desired_shards.ceil() as usize;
    // Do not downshard while more than ten seconds behind.
    if num_shards < current_shards && delay > 10.0 {
      log::debug!("not downsharding due to being too far behind");
      return current_shards;
    }

    num_shards.clamp(self.config().min_shards, self.config().max_shards)
  }

  fn should_reshard(&self, desired_shards: usize, current_shards: usize) -> bool {
    if desired_shards == current_shards {
      return false;
    }
    // If sends have not succeeded recently the endpoint is sick; churning the shard count would
    // only drop more samples.
    let min_send_timestamp =
      unix_now_seconds() - 2 * self.config().batch_send_deadline.as_secs() as i64;
    let last_send_timestamp = self.context.last_send_timestamp.load(Ordering::Relaxed);
    if last_send_timestamp < min_send_timestamp {
      log::warn!(
        "skipping resharding, last successful send {last_send_timestamp} was before threshold \
         {min_send_timestamp}"
      );
      return false;
    }
    true
  }
}

#[async_trait]
impl WalIngest for QueueManager {
  async fn append(&self, samples: &[RefSample]) -> bool {
    self.samples_in.incr(samples.len() as i64);
    if let Some(highest) = samples.iter().map(|s| s.timestamp).max() {
      self
        .context
        .stats
        .highest_recv_timestamp
        .set(highest as f64 / 1000.0);
    }

    'outer: for sample in samples {
      let labels = {
        let mut series = self.series.lock();
        match series.lookup(sample.reference) {
          Some(labels) => labels,
          None => {
            self.context.stats.samples_dropped_total.inc();
            self.samples_dropped.incr(1);
            if series.note_unknown(sample.reference) {
              log::info!(
                "dropped sample for series that was not explicitly dropped via relabelling, ref \
                 {}",
                sample.reference
              );
            }
            continue 'outer;
          },
        }
      };

      // This only loops while the target queue is full or the shards are being replaced.
      let mut backoff = self.config().min_backoff;
      loop {
        if self.quit.is_cancelled() {
          return false;
        }

        if self.shards.enqueue(
          sample.reference,
          PendingSample {
            labels: labels.clone(),
            timestamp: sample.timestamp,
            value: sample.value,
          },
        ) {
          continue 'outer;
        }

        self.context.stats.enqueue_retries_total.inc();
        tokio::select! {
          () = self.quit.cancelled() => return false,
          () = tokio::time::sleep(backoff) => {},
        }
        backoff = (backoff * 2).min(self.config().max_backoff);
      }
    }
    true
  }

  fn store_series(&self, series: &[RefSeries], segment: u32) {
    self.series.lock().store_series(
      &self.interner,
      &self.external_labels,
      self.relabel.as_ref(),
      series,
      segment,
    );
  }

  fn update_series_segment(&self, series: &[RefSeries], segment: u32) {
    self.series.lock().update_series_segment(series, segment);
  }

  fn series_reset(&self, checkpoint_segment: u32) {
    self.series.lock().reset(&self.interner, checkpoint_segment);
  }
}
