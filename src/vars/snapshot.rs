//! Binary hand-off of variable pools from the coordinator to node processes.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::pool::ExhaustibleVar;

/// File a node process reads its partition from.
pub const SNAPSHOT_FILE: &str = ".hakai.snapshot";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VarSnapshot {
    pub rotating: HashMap<String, Vec<String>>,
    pub exhaustible: HashMap<String, ExhaustibleVar>,
}

impl VarSnapshot {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).context("failed to encode variable snapshot")
    }

    /// Decoded exhaustible cursors always start from zero.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut snapshot: VarSnapshot =
            bincode::deserialize(bytes).context("failed to decode variable snapshot")?;
        for var in snapshot.exhaustible.values_mut() {
            var.offset = 0;
        }
        Ok(snapshot)
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let bytes = self.encode()?;
        std::fs::write(path, bytes)
            .with_context(|| format!("failed to write snapshot '{}'", path.display()))
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read snapshot '{}'", path.display()))?;
        Self::decode(&bytes)
    }

    /// The share of this snapshot owned by a node holding process slots
    /// `start..start + procs` out of `all_procs`. Rotating pools are copied
    /// whole; every exhaustible sequence is cut into interleaved strides.
    pub fn partition(&self, start: usize, procs: usize, all_procs: usize) -> VarSnapshot {
        let exhaustible = self
            .exhaustible
            .iter()
            .map(|(name, var)| {
                let values = partition_values(&var.values, start, procs, all_procs);
                (name.clone(), ExhaustibleVar::new(values))
            })
            .collect();

        VarSnapshot {
            rotating: self.rotating.clone(),
            exhaustible,
        }
    }
}

/// `values[i]` for every slot `o` in `start..start + procs` and every
/// `i = o, o + all_procs, o + 2 * all_procs, ...`.
pub fn partition_values(
    values: &[String],
    start: usize,
    procs: usize,
    all_procs: usize,
) -> Vec<String> {
    if all_procs == 0 {
        return Vec::new();
    }
    (start..start + procs)
        .flat_map(|slot| values.iter().skip(slot).step_by(all_procs))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("v{}", i)).collect()
    }

    #[test]
    fn test_two_single_proc_nodes_interleave() {
        let values = seq(4);
        assert_eq!(partition_values(&values, 0, 1, 2), ["v0", "v2"]);
        assert_eq!(partition_values(&values, 1, 1, 2), ["v1", "v3"]);
    }

    #[test]
    fn test_partitions_cover_every_value_once() {
        let values = seq(23);
        let procs = [3, 1, 2];
        let all: usize = procs.iter().sum();

        let mut start = 0;
        let mut union = Vec::new();
        for p in procs {
            union.extend(partition_values(&values, start, p, all));
            start += p;
        }

        union.sort();
        let mut expected = values.clone();
        expected.sort();
        assert_eq!(union, expected);
    }

    #[test]
    fn test_more_slots_than_values() {
        let values = seq(2);
        assert_eq!(partition_values(&values, 3, 1, 5), Vec::<String>::new());
        assert_eq!(partition_values(&values, 0, 5, 5), ["v0", "v1"]);
    }

    #[test]
    fn test_round_trip_resets_offsets() {
        let snapshot = VarSnapshot {
            rotating: HashMap::from([("r".to_string(), seq(3))]),
            exhaustible: HashMap::from([(
                "e".to_string(),
                ExhaustibleVar {
                    values: seq(5),
                    offset: 3,
                },
            )]),
        };

        let decoded = VarSnapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded.rotating, snapshot.rotating);
        assert_eq!(decoded.exhaustible["e"].values, seq(5));
        assert_eq!(decoded.exhaustible["e"].offset, 0);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(VarSnapshot::decode(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SNAPSHOT_FILE);
        let snapshot = VarSnapshot {
            rotating: HashMap::new(),
            exhaustible: HashMap::from([("e".to_string(), ExhaustibleVar::new(seq(2)))]),
        };
        snapshot.write_to(&path).unwrap();
        assert_eq!(VarSnapshot::read_from(&path).unwrap(), snapshot);
    }
}
