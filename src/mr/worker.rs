//! The worker runtime: deterministic partitioning of map output, the
//! reduce-side sort/group/commit pipeline, and the pull-loop backoff policy.
//! One worker is only ever touched by one process, so nothing here needs to
//! be `Sync` across tasks — each call runs to completion before the next.

use std::{
    fs::OpenOptions,
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
};

use glob::glob;
use tracing::debug;

use crate::mr::error::MrError;
use crate::mr::rpc::KeyValue;

/// The retry backoff a worker sleeps for after `TaskAssignment::Retry`.
pub const RETRY_BACKOFF_MS: u64 = 200;

pub type MapFn = fn(file: &str, contents: &str) -> Vec<(String, String)>;
pub type ReduceFn = fn(key: &str, values: Vec<String>) -> String;

/// Stable, deterministic 31-bit FNV-1a hash of `key`, used to pick a reduce
/// bucket. Fixed on one algorithm so re-runs after a crash agree with the
/// first attempt on where a key lands.
fn fnv1a_31(key: &str) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 0x811c9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in key.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash & 0x7fff_ffff
}

/// The reduce bucket `key` is assigned to out of `n_reduce` buckets.
pub fn bucket_for_key(key: &str, n_reduce: u32) -> u32 {
    fnv1a_31(key) % n_reduce
}

fn partition_file(map_id: u32, reduce_id: u32) -> PathBuf {
    PathBuf::from(format!("mr-{map_id}-{reduce_id}"))
}

fn output_file(reduce_id: u32) -> PathBuf {
    PathBuf::from(format!("mr-out-{reduce_id}"))
}

/// Reads `file`, invokes `map_fn`, and appends each resulting pair as a
/// self-delimiting JSON line to the partition file its key hashes to.
/// Partition files are opened append+create (0644) so a retried map attempt
/// piles onto whatever a prior, possibly-dead attempt already wrote.
pub fn run_map(map_id: u32, file: &str, n_reduce: u32, map_fn: MapFn) -> Result<(), MrError> {
    let contents = std::fs::read_to_string(file).map_err(|source| MrError::ReadInput {
        path: PathBuf::from(file),
        source,
    })?;

    let pairs = map_fn(file, &contents);
    debug!(file, pairs = pairs.len(), "map produced intermediate pairs");

    for (key, value) in pairs {
        let reduce_id = bucket_for_key(&key, n_reduce);
        let path = partition_file(map_id, reduce_id);
        let mut out = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(&path)
            .map_err(|source| MrError::WriteIntermediate {
                path: path.clone(),
                source,
            })?;
        let record = serde_json::to_string(&KeyValue::new(key, value))
            .expect("KeyValue serialization cannot fail");
        writeln!(out, "{record}").map_err(|source| MrError::WriteIntermediate {
            path: path.clone(),
            source,
        })?;
    }

    Ok(())
}

/// Gathers every `mr-*-<reduce_id>` partition file, sorts by key (ties
/// broken by the stable order they were read in), groups contiguous runs,
/// invokes `reduce_fn` per group, and commits the result via
/// write-then-rename so a crash mid-write never exposes a partial output.
pub fn run_reduce(reduce_id: u32, reduce_fn: ReduceFn) -> Result<(), MrError> {
    let pattern = format!("mr-*-{reduce_id}");
    let mut pairs = Vec::new();

    let paths = glob(&pattern).map_err(|source| MrError::Glob {
        pattern: pattern.clone(),
        source,
    })?;

    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                let path = e.path().to_path_buf();
                return Err(MrError::ReadInput {
                    path,
                    source: e.into_error(),
                });
            }
        };
        let contents = std::fs::read_to_string(&path).map_err(|source| MrError::ReadInput {
            path: path.clone(),
            source,
        })?;
        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<KeyValue>(line) {
                Ok(kv) => pairs.push(kv),
                Err(_) => {
                    return Err(MrError::MalformedRecord {
                        path: path.clone(),
                        line: line.to_string(),
                    })
                }
            }
        }
    }

    // Stable sort: equal keys keep the relative order they were read in.
    pairs.sort_by(|a, b| a.key.cmp(&b.key));

    let final_path = output_file(reduce_id);
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".mr-out-{reduce_id}-"))
        .tempfile_in(".")
        .map_err(|source| MrError::WriteOutput {
            path: final_path.clone(),
            source,
        })?;

    let mut i = 0;
    while i < pairs.len() {
        let mut j = i + 1;
        while j < pairs.len() && pairs[j].key == pairs[i].key {
            j += 1;
        }
        let values: Vec<String> = pairs[i..j].iter().map(|kv| kv.value.clone()).collect();
        let reduced = reduce_fn(&pairs[i].key, values);
        writeln!(tmp, "{} {}", pairs[i].key, reduced).map_err(|source| MrError::WriteOutput {
            path: final_path.clone(),
            source,
        })?;
        i = j;
    }

    tmp.persist(&final_path)
        .map_err(|e| MrError::WriteOutput {
            path: final_path.clone(),
            source: e.error,
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn hash_is_deterministic_and_31_bit() {
        let h1 = fnv1a_31("hello");
        let h2 = fnv1a_31("hello");
        assert_eq!(h1, h2);
        assert!(h1 <= 0x7fff_ffff);
    }

    #[test]
    fn bucket_assignment_is_stable_across_calls() {
        let keys = ["a", "b", "c", "quick brown fox", ""];
        let n_reduce = 7;
        let first: Vec<u32> = keys.iter().map(|k| bucket_for_key(k, n_reduce)).collect();
        let second: Vec<u32> = keys.iter().map(|k| bucket_for_key(k, n_reduce)).collect();
        assert_eq!(first, second);
        assert!(first.iter().all(|b| *b < n_reduce));
    }

    #[test]
    fn bucket_assignment_spreads_across_range_eventually() {
        let n_reduce = 4;
        let buckets: HashSet<u32> = (0..200)
            .map(|i| bucket_for_key(&format!("key-{i}"), n_reduce))
            .collect();
        assert!(buckets.len() > 1, "expected the hash to actually spread keys out");
    }

    #[test]
    fn map_then_reduce_round_trip_word_count() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let input = "input-a.txt";
        std::fs::write(input, "a a b").unwrap();

        fn map_fn(_file: &str, contents: &str) -> Vec<(String, String)> {
            contents
                .split_whitespace()
                .map(|w| (w.to_string(), "1".to_string()))
                .collect()
        }
        fn reduce_fn(_key: &str, values: Vec<String>) -> String {
            values.len().to_string()
        }

        run_map(0, input, 2, map_fn).unwrap();
        for reduce_id in 0..2 {
            run_reduce(reduce_id, reduce_fn).unwrap();
            assert!(output_file(reduce_id).exists());
        }

        let mut lines: Vec<String> = (0..2)
            .flat_map(|r| {
                std::fs::read_to_string(output_file(r))
                    .unwrap()
                    .lines()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>()
            })
            .collect();
        lines.sort();
        assert_eq!(lines, vec!["a 2".to_string(), "b 1".to_string()]);

        std::env::set_current_dir(cwd).unwrap();
    }
}
