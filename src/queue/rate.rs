// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./rate_test.rs"]
mod rate_test;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

//
// EwmaRate
//

// An exponentially weighted moving average of events per second. `incr` is called from hot paths
// and only touches an atomic; `tick` folds the accumulated count into the smoothed rate once per
// interval. The first tick that observes any events adopts the instantaneous rate outright.
#[derive(Clone)]
pub struct EwmaRate {
  inner: Arc<Inner>,
}

struct Inner {
  new_events: AtomicI64,
  alpha: f64,
  interval: Duration,
  state: Mutex<State>,
}

#[derive(Default)]
struct State {
  last_rate: f64,
  initialized: bool,
}

impl EwmaRate {
  #[must_use]
  pub fn new(alpha: f64, interval: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        new_events: AtomicI64::new(0),
        alpha,
        interval,
        state: Mutex::default(),
      }),
    }
  }

  // The smoothed events per second as of the last tick.
  pub fn rate(&self) -> f64 {
    self.inner.state.lock().last_rate
  }

  pub fn incr(&self, n: i64) {
    self.inner.new_events.fetch_add(n, Ordering::Relaxed);
  }

  // Fold the events observed since the last tick into the rate. Called once per shard update
  // interval by the control loop.
  pub fn tick(&self) {
    let new_events = self.inner.new_events.swap(0, Ordering::Relaxed);
    let instant_rate = new_events as f64 / self.inner.interval.as_secs_f64();

    let mut state = self.inner.state.lock();
    if state.initialized {
      state.last_rate += self.inner.alpha * (instant_rate - state.last_rate);
    } else if new_events > 0 {
      state.initialized = true;
      state.last_rate = instant_rate;
    }
  }
}
