use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context as _;
use atomicwrites::{AtomicFile, OverwriteBehavior::AllowOverwrite};
use glob::glob;
use tarpc::{client, context, tokio_serde::formats::Json};
use tokio::net::ToSocketAddrs;

use crate::rpc::MapReduceClient;
use crate::task::{
    intermediate_file, output_file, parse_intermediate_file, partition, KeyValue, Task,
};

pub type MapFn = fn(&str, &str) -> Vec<KeyValue>;
pub type ReduceFn = fn(&str, &[String]) -> String;

/// Executes tasks pulled from the coordinator until told to exit. Holds
/// no retry logic: any unexpected condition ends the process and the
/// coordinator's timeout recovers the task.
pub struct Worker {
    dir: PathBuf,
    n_reduce: usize,
    client: MapReduceClient,
    map_fn: MapFn,
    reduce_fn: ReduceFn,
}

impl Worker {
    /// Connects to the coordinator and asks for the reduce fan-out.
    /// Result files land under `dir`; map inputs are read from the paths
    /// the coordinator hands out.
    pub async fn connect(
        server: impl ToSocketAddrs,
        dir: impl Into<PathBuf>,
        map_fn: MapFn,
        reduce_fn: ReduceFn,
    ) -> anyhow::Result<Self> {
        let mut transport = tarpc::serde_transport::tcp::connect(server, Json::default);
        transport.config_mut().max_frame_length(usize::MAX);
        let client = MapReduceClient::new(client::Config::default(), transport.await?).spawn();

        let n_reduce = client
            .get_reduce_n(context::current())
            .await
            .context("cannot fetch reduce fan-out from coordinator")?;

        Ok(Worker {
            dir: dir.into(),
            n_reduce,
            client,
            map_fn,
            reduce_fn,
        })
    }

    /// The pull loop. Returns when the coordinator signals exit; any RPC
    /// transport failure or task I/O failure is an error the caller is
    /// expected to die on.
    pub async fn run(&self) -> anyhow::Result<()> {
        loop {
            let task = self.client.get_task(patient_context()).await?;
            match task {
                Task::Map { task_num, filename } => {
                    log::info!("running map task {task_num} on {filename}");
                    run_map_task(&self.dir, self.n_reduce, self.map_fn, task_num, &filename)?;
                    if let Err(e) = self
                        .client
                        .complete_map_task(context::current(), task_num)
                        .await?
                    {
                        // Lost the race: the task timed out here and was
                        // finished elsewhere. The files just published are
                        // superseded by whichever rename won.
                        log::warn!("map task {task_num} completion rejected: {e}");
                    }
                }
                Task::Reduce { task_num } => {
                    log::info!("running reduce task {task_num}");
                    run_reduce_task(&self.dir, self.reduce_fn, task_num)?;
                    if let Err(e) = self
                        .client
                        .complete_reduce_task(context::current(), task_num)
                        .await?
                    {
                        log::warn!("reduce task {task_num} completion rejected: {e}");
                    }
                }
                Task::Exit => {
                    log::info!("all tasks are finished, exiting");
                    return Ok(());
                }
            }
        }
    }
}

/// get_task legitimately parks the caller while every remaining task is
/// in progress elsewhere, so it gets a far wider deadline than the tarpc
/// default of ten seconds.
fn patient_context() -> context::Context {
    let mut ctx = context::current();
    ctx.deadline = SystemTime::now() + Duration::from_secs(60 * 60);
    ctx
}

/// Runs the user map function over one input file and publishes each
/// non-empty partition as `mr-<task_num>-<y>`. Records are line-delimited
/// JSON; the file appears atomically or not at all.
fn run_map_task(
    dir: &Path,
    n_reduce: usize,
    map_fn: MapFn,
    task_num: usize,
    filename: &str,
) -> anyhow::Result<()> {
    let contents =
        fs::read_to_string(filename).with_context(|| format!("cannot read map input {filename}"))?;
    let kvs = map_fn(filename, &contents);

    let mut buckets: BTreeMap<usize, Vec<KeyValue>> = BTreeMap::new();
    for kv in kvs {
        buckets.entry(partition(&kv.key, n_reduce)).or_default().push(kv);
    }

    for (reduce_num, records) in buckets {
        let mut encoded = Vec::new();
        for kv in &records {
            serde_json::to_writer(&mut encoded, kv)?;
            encoded.push(b'\n');
        }
        let path = dir.join(intermediate_file(task_num, reduce_num));
        AtomicFile::new(&path, AllowOverwrite)
            .write(|f| f.write_all(&encoded))
            .with_context(|| format!("cannot publish {}", path.display()))?;
    }
    Ok(())
}

/// Gathers partition `task_num` across all map outputs, groups values by
/// key in ascending key order, runs the user reduce function per group
/// and publishes `mr-out-<task_num>` atomically.
fn run_reduce_task(dir: &Path, reduce_fn: ReduceFn, task_num: usize) -> anyhow::Result<()> {
    let pattern = dir.join(format!("mr-*-{task_num}"));
    let pattern = pattern
        .to_str()
        .context("worker directory is not valid UTF-8")?;

    let mut kvs = Vec::new();
    for entry in glob(pattern)? {
        let path = entry?;
        // The pattern also catches mr-out-<task_num> left by an earlier
        // attempt of this very task; only mr-<map>-<reduce> names are map
        // output.
        let is_intermediate = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(parse_intermediate_file)
            .is_some();
        if !is_intermediate {
            continue;
        }
        let file =
            File::open(&path).with_context(|| format!("cannot open {}", path.display()))?;
        for line in BufReader::new(file).lines() {
            let kv: KeyValue = serde_json::from_str(&line?)?;
            kvs.push(kv);
        }
    }

    kvs.sort_by(|a, b| a.key.cmp(&b.key));

    let mut out = String::new();
    let mut i = 0;
    while i < kvs.len() {
        let mut j = i + 1;
        while j < kvs.len() && kvs[j].key == kvs[i].key {
            j += 1;
        }
        let values: Vec<String> = kvs[i..j].iter().map(|kv| kv.value.clone()).collect();
        let result = reduce_fn(&kvs[i].key, &values);
        out.push_str(&format!("{} {}\n", kvs[i].key, result));
        i = j;
    }

    let path = dir.join(output_file(task_num));
    AtomicFile::new(&path, AllowOverwrite)
        .write(|f| f.write_all(out.as_bytes()))
        .with_context(|| format!("cannot publish {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn wc_map(_filename: &str, contents: &str) -> Vec<KeyValue> {
        contents
            .split_whitespace()
            .map(|word| KeyValue {
                key: word.to_string(),
                value: "1".to_string(),
            })
            .collect()
    }

    fn wc_reduce(_key: &str, values: &[String]) -> String {
        values.len().to_string()
    }

    fn write_input(dir: &TempDir, name: &str, contents: &str) -> String {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path.to_str().unwrap().to_string()
    }

    #[test]
    fn map_publishes_partitioned_intermediates() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, "in.txt", "a a b");
        let n_reduce = 2;

        run_map_task(dir.path(), n_reduce, wc_map, 3, &input).unwrap();

        let mut records = Vec::new();
        for y in 0..n_reduce {
            let path = dir.path().join(intermediate_file(3, y));
            if !path.exists() {
                continue;
            }
            for line in fs::read_to_string(path).unwrap().lines() {
                let kv: KeyValue = serde_json::from_str(line).unwrap();
                // Every record sits in the partition its key hashes to.
                assert_eq!(partition(&kv.key, n_reduce), y);
                records.push(kv);
            }
        }
        let mut keys: Vec<String> = records.iter().map(|kv| kv.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "a", "b"]);
    }

    #[test]
    fn map_skips_empty_partitions() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, "in.txt", "solo");

        run_map_task(dir.path(), 8, wc_map, 0, &input).unwrap();

        let written: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.starts_with("mr-"))
            .collect();
        assert_eq!(written, vec![intermediate_file(0, partition("solo", 8))]);
    }

    #[test]
    fn map_of_empty_input_publishes_nothing() {
        let dir = TempDir::new().unwrap();
        let input = write_input(&dir, "empty.txt", "");

        run_map_task(dir.path(), 4, wc_map, 0, &input).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.starts_with("mr-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn map_fails_on_missing_input() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.txt");
        assert!(run_map_task(dir.path(), 2, wc_map, 0, missing.to_str().unwrap()).is_err());
    }

    #[test]
    fn reduce_groups_sorts_and_publishes() {
        let dir = TempDir::new().unwrap();
        // Partition 0 output of two different map tasks.
        for (map_num, words) in [(0, vec!["b", "a"]), (1, vec!["a", "c"])] {
            let mut encoded = Vec::new();
            for w in words {
                let kv = KeyValue {
                    key: w.to_string(),
                    value: "1".to_string(),
                };
                serde_json::to_writer(&mut encoded, &kv).unwrap();
                encoded.push(b'\n');
            }
            fs::write(dir.path().join(intermediate_file(map_num, 0)), encoded).unwrap();
        }

        run_reduce_task(dir.path(), wc_reduce, 0).unwrap();

        let out = fs::read_to_string(dir.path().join(output_file(0))).unwrap();
        assert_eq!(out, "a 2\nb 1\nc 1\n");
    }

    #[test]
    fn reduce_with_no_intermediates_publishes_empty_output() {
        let dir = TempDir::new().unwrap();
        run_reduce_task(dir.path(), wc_reduce, 5).unwrap();
        let out = fs::read_to_string(dir.path().join(output_file(5))).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn reduce_rerun_ignores_its_own_previous_output() {
        let dir = TempDir::new().unwrap();
        let kv = KeyValue {
            key: "a".to_string(),
            value: "1".to_string(),
        };
        let mut encoded = serde_json::to_vec(&kv).unwrap();
        encoded.push(b'\n');
        fs::write(dir.path().join(intermediate_file(0, 0)), encoded).unwrap();

        // First attempt published mr-out-0, then the task timed out and is
        // being executed again; the glob must not pick the old output up.
        run_reduce_task(dir.path(), wc_reduce, 0).unwrap();
        run_reduce_task(dir.path(), wc_reduce, 0).unwrap();

        let out = fs::read_to_string(dir.path().join(output_file(0))).unwrap();
        assert_eq!(out, "a 1\n");
    }

    #[test]
    fn reduce_leaves_no_temp_files_behind() {
        let dir = TempDir::new().unwrap();
        run_reduce_task(dir.path(), wc_reduce, 0).unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![output_file(0)]);
    }
}
