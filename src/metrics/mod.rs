//! Training metrics collection.

pub mod accumulator;

pub use accumulator::MetricsAccumulator;
