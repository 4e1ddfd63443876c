// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./interner_test.rs"]
mod interner_test;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

//
// Interner
//

// A reference counted string pool. Label names and values repeat across nearly every series the
// WAL hands us, so the series table holds one canonical copy of each string and tracks how many
// label sets reference it. Removal of a pool entry and the release that drops its count to zero
// happen under the same lock, so no reader can observe a removed entry that is still referenced.
#[derive(Default)]
pub struct Interner {
  pool: Mutex<HashMap<Arc<str>, usize>>,
}

impl Interner {
  // Returns the canonical instance of `s`, interning it on first use.
  pub fn intern(&self, s: &str) -> Arc<str> {
    let mut pool = self.pool.lock();
    if let Some(count) = pool.get_mut(s) {
      *count += 1;
      return pool
        .get_key_value(s)
        .expect("entry was just incremented")
        .0
        .clone();
    }

    let canonical: Arc<str> = Arc::from(s);
    pool.insert(canonical.clone(), 1);
    canonical
  }

  pub fn release(&self, s: &str) {
    let mut pool = self.pool.lock();
    let Some(count) = pool.get_mut(s) else {
      // Releasing a string that was never interned indicates ref accounting drift upstream.
      log::debug!("released string with no interned reference: {s:?}");
      return;
    };

    *count -= 1;
    if *count == 0 {
      pool.remove(s);
    }
  }

  pub fn len(&self) -> usize {
    self.pool.lock().len()
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.pool.lock().is_empty()
  }
}
