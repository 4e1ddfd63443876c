// pulse - bitdrift's observability proxy
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

// Wire types for the Prometheus remote write v1 protocol. Field numbers and enum values follow
// prompb/remote.proto and prompb/types.proto.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct WriteRequest {
  #[prost(message, repeated, tag = "1")]
  pub timeseries: Vec<TimeSeries>,
  // Field 2 is reserved.
  #[prost(message, repeated, tag = "3")]
  pub metadata: Vec<MetricMetadata>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TimeSeries {
  #[prost(message, repeated, tag = "1")]
  pub labels: Vec<Label>,
  #[prost(message, repeated, tag = "2")]
  pub samples: Vec<Sample>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Label {
  #[prost(string, tag = "1")]
  pub name: String,
  #[prost(string, tag = "2")]
  pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Sample {
  #[prost(double, tag = "1")]
  pub value: f64,
  #[prost(int64, tag = "2")]
  pub timestamp: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct MetricMetadata {
  #[prost(enumeration = "MetricType", tag = "1")]
  pub r#type: i32,
  #[prost(string, tag = "2")]
  pub metric_family_name: String,
  #[prost(string, tag = "4")]
  pub help: String,
  #[prost(string, tag = "5")]
  pub unit: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MetricType {
  Unknown = 0,
  Counter = 1,
  Gauge = 2,
  Histogram = 3,
  GaugeHistogram = 4,
  Summary = 5,
  Info = 6,
  Stateset = 7,
}
