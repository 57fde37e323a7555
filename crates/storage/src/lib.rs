//! Batched columnar table I/O for nanoquery.
//!
//! A logical table is one parquet file. Reads are column-projecting and batch-wise, writes are
//! single-pass and append-only, and metadata (rows, columns, row groups, size) is available
//! without decoding row data.

pub mod catalog;
pub mod stats;
pub mod table;

pub use catalog::*;
pub use stats::*;
pub use table::*;
