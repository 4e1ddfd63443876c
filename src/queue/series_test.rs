// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use crate::queue::interner::Interner;
use crate::queue::series::{process_external_labels, RelabelFn, SeriesTable};
use crate::test::make_series;
use pretty_assertions::assert_eq;

fn pairs(labels: &[(&str, &str)]) -> Vec<(String, String)> {
  labels
    .iter()
    .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
    .collect()
}

#[test]
fn external_labels_merge_with_series_winning_ties() {
  let merged = process_external_labels(
    &pairs(&[("__name__", "m"), ("region", "eu")]),
    &pairs(&[("cluster", "a"), ("region", "us")]),
  );
  assert_eq!(
    pairs(&[("__name__", "m"), ("cluster", "a"), ("region", "eu")]),
    merged
  );
}

#[test]
fn external_labels_merge_edge_positions() {
  // External labels sorting entirely before and after the series labels.
  let merged = process_external_labels(
    &pairs(&[("job", "node")]),
    &pairs(&[("aaa", "1"), ("zzz", "2")]),
  );
  assert_eq!(pairs(&[("aaa", "1"), ("job", "node"), ("zzz", "2")]), merged);

  let merged = process_external_labels(&[], &pairs(&[("cluster", "a")]));
  assert_eq!(pairs(&[("cluster", "a")]), merged);
}

#[test]
fn store_and_lookup() {
  let interner = Interner::default();
  let mut table = SeriesTable::default();
  table.store_series(
    &interner,
    &[],
    None,
    &[make_series(7, &[("__name__", "x"), ("job", "node")])],
    1,
  );

  let labels = table.lookup(7).unwrap();
  assert_eq!(2, labels.len());
  assert_eq!("__name__", &*labels[0].name);
  assert_eq!("x", &*labels[0].value);
  assert!(table.lookup(8).is_none());
  // name + value for each pair, all distinct.
  assert_eq!(4, interner.len());
}

#[test]
fn replacing_a_series_releases_the_old_strings() {
  let interner = Interner::default();
  let mut table = SeriesTable::default();
  table.store_series(&interner, &[], None, &[make_series(7, &[("job", "old")])], 1);
  table.store_series(&interner, &[], None, &[make_series(7, &[("job", "new")])], 2);

  assert_eq!("new", &*table.lookup(7).unwrap()[0].value);
  // "job" and "new"; "old" must be gone.
  assert_eq!(2, interner.len());
}

#[test]
fn relabel_dropping_a_series_marks_it_dropped() {
  let interner = Interner::default();
  let mut table = SeriesTable::default();
  let relabel: RelabelFn = Box::new(|labels| {
    if labels.iter().any(|(_, value)| value == "dropme") {
      None
    } else {
      Some(labels)
    }
  });

  table.store_series(
    &interner,
    &[],
    Some(&relabel),
    &[
      make_series(1, &[("__name__", "dropme")]),
      make_series(2, &[("__name__", "keep")]),
    ],
    1,
  );

  assert!(table.lookup(1).is_none());
  assert!(table.lookup(2).is_some());
  // A relabel-dropped ref is expected; it must not be reported as unknown.
  assert!(!table.note_unknown(1));
  assert!(interner.len() > 0);
}

#[test]
fn relabel_to_empty_drops() {
  let interner = Interner::default();
  let mut table = SeriesTable::default();
  let relabel: RelabelFn = Box::new(|_| Some(Vec::new()));
  table.store_series(&interner, &[], Some(&relabel), &[make_series(1, &[("a", "b")])], 1);
  assert!(table.lookup(1).is_none());
  assert!(interner.is_empty());
}

#[test]
fn reset_evicts_series_older_than_checkpoint() {
  let interner = Interner::default();
  let mut table = SeriesTable::default();
  table.store_series(&interner, &[], None, &[make_series(1, &[("job", "one")])], 1);
  table.store_series(&interner, &[], None, &[make_series(2, &[("job", "two")])], 2);

  table.reset(&interner, 2);

  assert!(table.lookup(1).is_none());
  assert!(table.lookup(2).is_some());
  assert_eq!(1, table.len());
  // Only "job" and "two" remain interned; "one" was released.
  assert_eq!(2, interner.len());
}

#[test]
fn update_series_segment_moves_a_ref_past_a_checkpoint() {
  let interner = Interner::default();
  let mut table = SeriesTable::default();
  table.store_series(&interner, &[], None, &[make_series(1, &[("job", "one")])], 1);
  table.update_series_segment(&[make_series(1, &[])], 3);

  table.reset(&interner, 2);
  assert!(table.lookup(1).is_some());
}

#[test]
fn note_unknown_reports_once_per_ref() {
  let mut table = SeriesTable::default();
  assert!(table.note_unknown(42));
  assert!(!table.note_unknown(42));
  assert!(table.note_unknown(43));
}

#[test]
fn release_all_empties_the_intern_pool() {
  let interner = Interner::default();
  let mut table = SeriesTable::default();
  table.store_series(
    &interner,
    &[],
    None,
    &[
      make_series(1, &[("job", "one")]),
      make_series(2, &[("job", "two")]),
    ],
    1,
  );
  assert!(!interner.is_empty());

  table.release_all(&interner);
  assert!(interner.is_empty());
  assert!(table.is_empty());
}
