//! Clusters and the call results they produce.

pub(crate) mod binder;
mod executor;
pub(crate) mod poll_loop;
pub(crate) mod split;
pub(crate) mod tagger;

use std::collections::HashMap;
use std::sync::Arc;

use crate::conn::result::{QueryResult, Row};
use crate::conn::PartitionConnection;
use crate::conn_str::ConnStr;
use crate::error::{Error, Result};
use crate::host::HostHooks;
use crate::options::{ClusterOptions, DefaultUser};

/// A named collection of partitions sharing one configuration.
///
/// The partition map assigns each of the (power-of-two many) partition slots
/// to a physical connection; slots with identical connect strings share one
/// connection. A cluster executes at most one call at a time, and the
/// `&mut self` receiver of [`Cluster::execute`] enforces that statically for
/// well-behaved embeddings.
pub struct Cluster {
    pub(crate) name: String,
    pub(crate) options: ClusterOptions,
    pub(crate) hooks: Arc<dyn HostHooks>,
    pub(crate) conn_list: Vec<PartitionConnection>,
    /// Partition slot to connection index.
    pub(crate) part_map: Vec<usize>,
    pub(crate) part_mask: u32,
    pub(crate) busy: bool,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("conn_list_len", &self.conn_list.len())
            .field("part_map", &self.part_map)
            .field("part_mask", &self.part_mask)
            .field("busy", &self.busy)
            .finish()
    }
}

impl Cluster {
    /// Builds a cluster from its partition connect strings.
    ///
    /// The partition count must be a nonzero power of two. Connect strings
    /// that omit a user get the principal selected by
    /// [`ClusterOptions::default_user`], and duplicates deduplicate to a
    /// single shared connection.
    pub fn new(
        name: impl Into<String>,
        options: ClusterOptions,
        partitions: &[String],
        hooks: Arc<dyn HostHooks>,
    ) -> Result<Self> {
        let name = name.into();
        let count = partitions.len();
        if count == 0 || !count.is_power_of_two() {
            return Err(Error::config(format!(
                "cluster \"{name}\" has {count} partitions, expected a nonzero power of two"
            )));
        }
        let principal = match options.default_user {
            DefaultUser::CurrentUser => hooks.current_user(),
            DefaultUser::SessionUser => hooks.session_user(),
        };

        let mut conn_list: Vec<PartitionConnection> = Vec::new();
        let mut by_connstr: HashMap<(String, String), usize> = HashMap::new();
        let mut part_map = Vec::with_capacity(count);
        for raw in partitions {
            let connstr = ConnStr::parse(raw)?;
            let user = connstr.user().unwrap_or(principal.as_str()).to_string();
            let key = (raw.clone(), user.clone());
            let ci = match by_connstr.get(&key) {
                Some(&ci) => ci,
                None => {
                    conn_list.push(PartitionConnection::new(connstr, user));
                    let ci = conn_list.len() - 1;
                    by_connstr.insert(key, ci);
                    ci
                }
            };
            part_map.push(ci);
        }

        Ok(Self {
            name,
            options,
            hooks,
            conn_list,
            part_map,
            part_mask: (count - 1) as u32,
            busy: false,
        })
    }

    /// The cluster name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of partition slots.
    pub fn partition_count(&self) -> usize {
        self.part_map.len()
    }

    /// Number of distinct physical connections backing the slots.
    pub fn connection_count(&self) -> usize {
        self.conn_list.len()
    }

    /// The configuration snapshot this cluster runs with.
    pub fn options(&self) -> &ClusterOptions {
        &self.options
    }

    /// Maps a hash value to its partition slot.
    pub(crate) fn mask(&self, hash: i64) -> usize {
        (hash & i64::from(self.part_mask)) as usize
    }

    /// Arms the connection behind a partition slot. The first tag a
    /// connection receives within a call wins.
    pub(crate) fn tag_partition(&mut self, part: usize, tag: u32) {
        let ci = self.part_map[part];
        let conn = &mut self.conn_list[ci];
        if conn.run_tag == 0 {
            conn.run_tag = tag;
        }
    }
}

/// The union of tuple results of one completed call, in connection-index
/// order.
#[derive(Debug)]
pub struct ClusterResults {
    ret_total: u64,
    partitions: Vec<PartitionResult>,
}

/// The tuple result one connection produced.
#[derive(Debug)]
#[non_exhaustive]
pub struct PartitionResult {
    /// Index of the connection in the cluster's connection list.
    pub connection: usize,
    /// The result, exactly one per armed connection.
    pub result: QueryResult,
}

impl ClusterResults {
    /// Total row count across all selected partitions.
    pub fn ret_total(&self) -> u64 {
        self.ret_total
    }

    /// Per-connection results, ordered by connection index.
    pub fn partitions(&self) -> &[PartitionResult] {
        &self.partitions
    }

    /// Walks every row, partition by partition in connection-index order.
    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.partitions.iter().flat_map(|p| p.result.rows().iter())
    }
}
