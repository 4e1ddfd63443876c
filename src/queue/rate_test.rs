// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::queue::rate::EwmaRate;
use std::time::Duration;

const INTERVAL: Duration = Duration::from_secs(10);

#[test]
fn first_tick_adopts_instantaneous_rate() {
  let rate = EwmaRate::new(0.2, INTERVAL);
  assert_eq!(0.0, rate.rate());

  rate.incr(100);
  rate.tick();
  assert!((rate.rate() - 10.0).abs() < f64::EPSILON);
}

#[test]
fn later_ticks_are_smoothed() {
  let rate = EwmaRate::new(0.2, INTERVAL);
  rate.incr(100);
  rate.tick();

  // 0.2 * 20 + 0.8 * 10.
  rate.incr(200);
  rate.tick();
  assert!((rate.rate() - 12.0).abs() < 1e-9);

  // An idle interval decays toward zero.
  rate.tick();
  assert!((rate.rate() - 9.6).abs() < 1e-9);
}

#[test]
fn empty_ticks_do_not_initialize() {
  let rate = EwmaRate::new(0.2, INTERVAL);
  rate.tick();
  rate.tick();
  assert_eq!(0.0, rate.rate());

  // The first interval with events still counts as instantaneous, not decayed.
  rate.incr(50);
  rate.tick();
  assert!((rate.rate() - 5.0).abs() < f64::EPSILON);
}
