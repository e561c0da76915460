//! Trimming support: membership testing over sets of call numbers.
//!
//! Trimming tools walk a trace once, deciding per call whether it stays.
//! The decisions arrive as call numbers in roughly increasing bursts, so
//! [`CallSet`] stores merged ranges in a skip list — the structure grows
//! with the number of *gaps* in the kept set, not the number of calls,
//! while lookups and inserts stay expected-logarithmic even for
//! out-of-order queries.

pub mod callset;

pub use callset::CallSet;
