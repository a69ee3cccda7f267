//! tsql - a time-series query engine
//!
//! This crate provides the single-node query pipeline for a time-series
//! database: lexing and parsing a query language, resolving it against a
//! metadata catalog, planning an operator tree, and demand-pull execution
//! against a storage reader.

pub mod metrics;
pub mod query;
pub mod storage;
