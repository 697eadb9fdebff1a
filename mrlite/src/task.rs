use std::fmt;

use serde::{Deserialize, Serialize};

/// A single record emitted by a map function and consumed by a reduce
/// function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskPhase {
    Map,
    Reduce,
}

impl fmt::Display for TaskPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskPhase::Map => write!(f, "map"),
            TaskPhase::Reduce => write!(f, "reduce"),
        }
    }
}

/// What the coordinator hands a worker that asked for work. A map task
/// carries the input file it covers; a reduce task only its partition
/// index. `Exit` tells the worker the job is finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Task {
    Map { task_num: usize, filename: String },
    Reduce { task_num: usize },
    Exit,
}

/// 32-bit FNV-1a of the key bytes, masked non-negative. Which partition a
/// key lands in (and so which `mr-<x>-<y>` file carries it) follows from
/// this hash, so it is part of the on-disk format.
pub fn ihash(key: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in key.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash & 0x7fff_ffff
}

/// Reduce partition for `key` under a fan-out of `n_reduce`.
pub fn partition(key: &str, n_reduce: usize) -> usize {
    ihash(key) as usize % n_reduce
}

/// Name of the intermediate file holding map task `map_num`'s records for
/// reduce partition `reduce_num`.
pub fn intermediate_file(map_num: usize, reduce_num: usize) -> String {
    format!("mr-{map_num}-{reduce_num}")
}

/// Name of the final output file for reduce partition `reduce_num`.
pub fn output_file(reduce_num: usize) -> String {
    format!("mr-out-{reduce_num}")
}

/// Parses `mr-<map>-<reduce>` back into its indices. Returns `None` for
/// anything else, including `mr-out-<y>` files.
pub fn parse_intermediate_file(name: &str) -> Option<(usize, usize)> {
    let rest = name.strip_prefix("mr-")?;
    let (map_part, reduce_part) = rest.split_once('-')?;
    Some((map_part.parse().ok()?, reduce_part.parse().ok()?))
}
