//! A small distributed MapReduce runtime: a coordinator that schedules
//! map and reduce tasks over anonymous workers, and the worker-side
//! execution protocol (partitioning, intermediate file layout, atomic
//! result publication).

pub mod coordinator;
pub mod rpc;
pub mod task;
pub mod worker;

pub use coordinator::Coordinator;
pub use task::KeyValue;
pub use worker::Worker;
