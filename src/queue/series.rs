// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./series_test.rs"]
mod series_test;

use crate::queue::interner::Interner;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// A sample as read from the WAL: a series reference and one point.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RefSample {
  pub reference: u64,
  pub timestamp: i64,
  pub value: f64,
}

// A series record as read from the WAL: a reference and its raw label pairs, sorted by name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefSeries {
  pub reference: u64,
  pub labels: Vec<(String, String)>,
}

// One interned label pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Label {
  pub name: Arc<str>,
  pub value: Arc<str>,
}

pub type LabelSet = Vec<Label>;

// Applied to the merged label set before interning. Relabel rule parsing lives with the
// configuration layer; the queue only needs the resulting transform. Returning None drops the
// series.
pub type RelabelFn =
  Box<dyn Fn(Vec<(String, String)>) -> Option<Vec<(String, String)>> + Send + Sync>;

// Merge external labels into a series' labels. Both inputs are sorted by name; on a name
// collision the per series value wins.
#[must_use]
pub fn process_external_labels(
  labels: &[(String, String)],
  external_labels: &[(String, String)],
) -> Vec<(String, String)> {
  let mut result = Vec::with_capacity(labels.len() + external_labels.len());
  let (mut i, mut j) = (0, 0);
  while i < labels.len() && j < external_labels.len() {
    match labels[i].0.cmp(&external_labels[j].0) {
      std::cmp::Ordering::Less => {
        result.push(labels[i].clone());
        i += 1;
      },
      std::cmp::Ordering::Greater => {
        result.push(external_labels[j].clone());
        j += 1;
      },
      std::cmp::Ordering::Equal => {
        result.push(labels[i].clone());
        i += 1;
        j += 1;
      },
    }
  }
  result.extend_from_slice(&labels[i ..]);
  result.extend_from_slice(&external_labels[j ..]);
  result
}

//
// SeriesTable
//

// Tracks every series the WAL watcher has told us about: its processed (externally merged and
// relabeled) label set, the WAL segment it was last seen in, and whether relabeling dropped it.
// The owning queue manager serializes all access behind one lock.
#[derive(Default)]
pub struct SeriesTable {
  labels: HashMap<u64, Arc<LabelSet>>,
  segments: HashMap<u64, u32>,
  dropped: HashSet<u64>,
  // Refs that were neither stored nor dropped but showed up in Append; each is logged once.
  logged_unknown: HashSet<u64>,
}

impl SeriesTable {
  // Install a batch of series records seen in `segment`. Replacing an existing label set
  // releases the old interned strings under the same critical section as the replacement.
  pub fn store_series(
    &mut self,
    interner: &Interner,
    external_labels: &[(String, String)],
    relabel: Option<&RelabelFn>,
    series: &[RefSeries],
    segment: u32,
  ) {
    for record in series {
      self.segments.insert(record.reference, segment);

      let merged = process_external_labels(&record.labels, external_labels);
      let processed = match relabel {
        Some(relabel) => relabel(merged),
        None => Some(merged),
      };
      let Some(processed) = processed.filter(|labels| !labels.is_empty()) else {
        self.dropped.insert(record.reference);
        continue;
      };

      let interned: LabelSet = processed
        .iter()
        .map(|(name, value)| Label {
          name: interner.intern(name),
          value: interner.intern(value),
        })
        .collect();

      if let Some(old) = self.labels.insert(record.reference, Arc::new(interned)) {
        release_labels(interner, &old);
      }
    }
  }

  // Refresh only the segment index for records re-read out of a checkpoint.
  pub fn update_series_segment(&mut self, series: &[RefSeries], segment: u32) {
    for record in series {
      self.segments.insert(record.reference, segment);
    }
  }

  // Evict every series whose recorded segment predates the checkpoint, releasing its strings.
  pub fn reset(&mut self, interner: &Interner, checkpoint_segment: u32) {
    self.segments.retain(|reference, segment| {
      if *segment >= checkpoint_segment {
        return true;
      }
      if let Some(labels) = self.labels.remove(reference) {
        release_labels(interner, &labels);
      }
      self.dropped.remove(reference);
      false
    });
    self.logged_unknown.clear();
  }

  pub fn lookup(&self, reference: u64) -> Option<Arc<LabelSet>> {
    self.labels.get(&reference).cloned()
  }

  // True the first time an unknown (neither stored nor relabel-dropped) ref is seen, so the
  // caller can log it exactly once.
  pub fn note_unknown(&mut self, reference: u64) -> bool {
    !self.dropped.contains(&reference) && self.logged_unknown.insert(reference)
  }

  // Release every interned string still held. Used at queue shutdown.
  pub fn release_all(&mut self, interner: &Interner) {
    for labels in self.labels.values() {
      release_labels(interner, labels);
    }
    self.labels.clear();
    self.segments.clear();
    self.dropped.clear();
    self.logged_unknown.clear();
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }
}

fn release_labels(interner: &Interner, labels: &LabelSet) {
  for label in labels {
    interner.release(&label.name);
    interner.release(&label.value);
  }
}
