// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


pub mod prompb;

use bytes::Bytes;
use prompb::{MetricMetadata, TimeSeries, WriteRequest};
use prost::Message;

/// A framed write request ready to hand to the transport, along with the accounting the queue
/// needs: the highest sample timestamp in the request (ms) and the uncompressed proto size.
pub struct FramedRequest {
  pub compressed: Bytes,
  pub highest_timestamp: i64,
  pub uncompressed_len: usize,
}

// Frame samples and/or metadata into a compressed WriteRequest. The scratch buffer is grown to
// snappy's worst case length before compressing so the compressor can reuse it across batches.
pub fn build_write_request(
  samples: &[TimeSeries],
  metadata: &[MetricMetadata],
  scratch: &mut Vec<u8>,
) -> FramedRequest {
  let mut highest_timestamp = 0;
  for series in samples {
    // Every series carries exactly one sample.
    if let Some(sample) = series.samples.first() {
      if sample.timestamp > highest_timestamp {
        highest_timestamp = sample.timestamp;
      }
    }
  }

  let request = WriteRequest {
    timeseries: samples.to_vec(),
    metadata: metadata.to_vec(),
  };
  let encoded = request.encode_to_vec();

  scratch.resize(snap::raw::max_compress_len(encoded.len()), 0);
  let compressed_len = snap::raw::Encoder::new()
    .compress(&encoded, scratch)
    .expect("scratch is sized to max_compress_len");
  scratch.truncate(compressed_len);
  log::debug!(
    "compressed WriteRequest {} bytes to {} bytes",
    encoded.len(),
    compressed_len
  );

  FramedRequest {
    compressed: Bytes::copy_from_slice(scratch),
    highest_timestamp,
    uncompressed_len: encoded.len(),
  }
}

// Preallocate reusable batch slots, each with a single sample, so shard workers never allocate
// per enqueued sample.
#[must_use]
pub fn allocate_timeseries(capacity: usize) -> Vec<TimeSeries> {
  (0 .. capacity)
    .map(|_| TimeSeries {
      labels: Vec::new(),
      samples: vec![prompb::Sample::default()],
    })
    .collect()
}
