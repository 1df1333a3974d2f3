//! A partitioned PostgreSQL query fan-out engine.
//!
//! A caller supplies a logical function invocation with typed arguments; the
//! engine selects one or more backend partitions from a named [`Cluster`],
//! dispatches a parameterized query to each selected partition concurrently,
//! collects the tuple results, and returns their union. One logical call
//! becomes one physical call per partition that owns the relevant data.
//!
//! Partition selection is driven by the function's [`RunOn`] clause: all
//! partitions, one numbered or randomly chosen partition, or the partitions
//! picked by a host-evaluated hash query. Array arguments can additionally
//! be declared *split*, fanning their elements out element-wise so each
//! partition receives exactly the slice of the input it owns.
//!
//! The engine is strictly single-threaded and non-blocking: every selected
//! connection is a small state machine, and one poll loop per call drives
//! login, query submission, result drain, timeout enforcement, and host
//! cancellation across all of them.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pgfanout::{
//!     Cluster, ClusterOptions, HostHooks, PgValue, ProxyFunction, ProxyQuery, ReturnType,
//!     RunOn,
//! };
//!
//! struct Hooks;
//!
//! impl HostHooks for Hooks {
//!     fn current_user(&self) -> String {
//!         "app".to_string()
//!     }
//! }
//!
//! # async fn run() -> pgfanout::Result<()> {
//! let partitions: Vec<String> = (0..4)
//!     .map(|i| format!("host=db{i}.example.com dbname=shard"))
//!     .collect();
//! let mut cluster = Cluster::new("userdb", ClusterOptions::default(), &partitions, Arc::new(Hooks))?;
//!
//! let func = ProxyFunction::new(
//!     "get_user",
//!     vec![pgfanout::oid::TEXT],
//!     RunOn::All,
//!     ReturnType::Composite(vec![pgfanout::oid::TEXT, pgfanout::oid::TEXT]),
//!     ProxyQuery::call("get_user", 1),
//! );
//! let results = cluster
//!     .execute(&func, &[PgValue::Text("alice".into())], None)
//!     .await?;
//! for row in results.rows() {
//!     let _name = row.get(0);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::cast_possible_wrap)]

mod cluster;
mod conn;
mod conn_str;
pub mod error;
mod function;
mod host;
mod options;
pub mod types;

pub use crate::cluster::{Cluster, ClusterResults, PartitionResult};
pub use crate::conn::result::{Column, QueryResult, Row};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::function::{ProxyFunction, ProxyQuery, ReturnType, RunOn};
pub use crate::host::{HashSource, HostHooks, Notice};
pub use crate::options::{ClusterOptions, DefaultUser};
pub use crate::types::{oid, DatumArray, Oid, PgValue};
