//! MapReduce applications runnable by the mrlite worker.

pub mod indexer;
pub mod wc;
