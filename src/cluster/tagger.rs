//! Partition selection for one call.

use rand::Rng;

use crate::cluster::{split, Cluster};
use crate::error::{Error, Result};
use crate::function::{ProxyFunction, RunOn};
use crate::host::HashSource;
use crate::types::PgValue;

/// Marks the partitions this call executes on by setting their connections'
/// `run_tag`. Split-array calls route element-wise instead.
pub(crate) fn tag_partitions(
    cluster: &mut Cluster,
    func: &ProxyFunction,
    args: &[PgValue],
    hash: Option<&mut dyn HashSource>,
) -> Result<()> {
    if func.has_split_args() {
        return split::plan_split(cluster, func, args, hash);
    }
    match &func.run_on {
        RunOn::All => {
            for part in 0..cluster.part_map.len() {
                cluster.tag_partition(part, 1);
            }
        }
        RunOn::Exact(n) => {
            let count = cluster.part_map.len();
            if *n < 0 || *n as usize >= count {
                return Err(Error::config(format!(
                    "invalid partition number {n}, cluster \"{}\" has {count} partitions",
                    cluster.name
                )));
            }
            cluster.tag_partition(*n as usize, 1);
        }
        RunOn::Any => {
            let part = (rand::rng().random::<u32>() & cluster.part_mask) as usize;
            cluster.tag_partition(part, 1);
        }
        RunOn::Hash(sql) => {
            let source =
                hash.ok_or_else(|| Error::config("hash routing requires a hash source"))?;
            let rows = source.hash_rows(sql, args)?;
            check_hash_cardinality(rows.len(), func)?;
            for value in rows {
                let value =
                    value.ok_or_else(|| Error::split("hash query returned a null value"))?;
                let part = cluster.mask(value);
                cluster.tag_partition(part, 1);
            }
        }
    }
    Ok(())
}

/// A hash query must select exactly one partition row unless the function
/// returns a set, in which case any number of rows (including none) unions.
pub(crate) fn check_hash_cardinality(rows: usize, func: &ProxyFunction) -> Result<()> {
    if func.returns_set || rows == 1 {
        Ok(())
    } else {
        Err(Error::split(format!(
            "hash query for {} returned {rows} rows, expected 1",
            func.name
        )))
    }
}
