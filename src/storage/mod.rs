//! Storage-facing types for the query engine
//! Sample and label data structures plus the catalog and reader capability
//! traits the pipeline consumes, with in-memory implementations.

pub mod catalog;
pub mod reader;
pub mod series;

pub use catalog::{Catalog, LabelMatcher, MatchOp, MemoryCatalog, MetricInfo, SeriesEntry};
pub use reader::{MemoryStorage, ReadError, SampleIter, StorageReader};
pub use series::{Labels, Sample, SeriesFrame, SeriesId, Timestamp};
