//! Descriptors for the fanned-out function and its remote query.
//!
//! These are the outputs of the host's SQL parser, consumed here as plain
//! data: which partitions to run on, which arguments split, and the remote
//! query text with its placeholder-to-argument mapping.

use crate::error::{Error, Result};
use crate::types::{self, Oid};

/// The partition-selection clause of a function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOn {
    /// Execute on every partition.
    All,
    /// Execute on one uniformly chosen partition.
    Any,
    /// Execute on the numbered partition.
    Exact(i32),
    /// Execute on the partitions selected by the hash query.
    Hash(String),
}

/// Shape of the remote result, used to decide binary transfer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReturnType {
    /// A scalar (or setof scalar) return.
    Scalar(Oid),
    /// A composite return with one OID per column.
    Composite(Vec<Oid>),
}

impl ReturnType {
    pub(crate) fn binary_recv_ok(&self) -> bool {
        match self {
            Self::Scalar(oid) => types::binary_recv_supported(*oid),
            Self::Composite(oids) => oids.iter().all(|oid| types::binary_recv_supported(*oid)),
        }
    }
}

/// The parameterized query submitted to each selected partition.
///
/// Placeholder `$n` takes its value from function argument
/// `arg_lookup[n - 1]`. Created once per function and immutable thereafter.
#[derive(Clone, Debug)]
pub struct ProxyQuery {
    sql: String,
    arg_lookup: Vec<usize>,
}

impl ProxyQuery {
    /// Creates a query from SQL text and its placeholder mapping.
    pub fn new(sql: impl Into<String>, arg_lookup: Vec<usize>) -> Self {
        Self {
            sql: sql.into(),
            arg_lookup,
        }
    }

    /// The default remote query: call the same function with every argument
    /// passed through in order.
    pub fn call(function_name: &str, arg_count: usize) -> Self {
        let placeholders: Vec<String> = (1..=arg_count).map(|n| format!("${n}")).collect();
        Self {
            sql: format!(
                "select * from {}({})",
                function_name,
                placeholders.join(", ")
            ),
            arg_lookup: (0..arg_count).collect(),
        }
    }

    pub(crate) fn sql(&self) -> &str {
        &self.sql
    }

    pub(crate) fn arg_lookup(&self) -> &[usize] {
        &self.arg_lookup
    }

    pub(crate) fn param_count(&self) -> usize {
        self.arg_lookup.len()
    }
}

/// A fanned-out function: argument shape, routing mode, and remote query.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ProxyFunction {
    /// Qualified name, used for error and notice attribution.
    pub name: String,
    /// One OID per argument; for split arguments this is the element type.
    pub arg_oids: Vec<Oid>,
    /// Which arguments are split arrays.
    pub split_args: Vec<bool>,
    /// Partition selection mode.
    pub run_on: RunOn,
    /// Whether the function is declared to return a set. Gates how many rows
    /// the hash query may produce.
    pub returns_set: bool,
    /// Result shape.
    pub ret_type: ReturnType,
    /// Route all split elements with one generate-series probe instead of
    /// one hash execution per element.
    pub optimized_split: bool,
    /// The remote query.
    pub query: ProxyQuery,
}

impl ProxyFunction {
    /// Creates a function descriptor with no split arguments that returns a
    /// single row.
    pub fn new(
        name: impl Into<String>,
        arg_oids: Vec<Oid>,
        run_on: RunOn,
        ret_type: ReturnType,
        query: ProxyQuery,
    ) -> Self {
        let split_args = vec![false; arg_oids.len()];
        Self {
            name: name.into(),
            arg_oids,
            split_args,
            run_on,
            returns_set: false,
            ret_type,
            optimized_split: false,
            query,
        }
    }

    /// Marks the given arguments as split arrays.
    pub fn with_split_args(mut self, split: &[usize]) -> Self {
        for &idx in split {
            if let Some(flag) = self.split_args.get_mut(idx) {
                *flag = true;
            }
        }
        self
    }

    /// Marks the function as set-returning.
    pub fn returning_set(mut self) -> Self {
        self.returns_set = true;
        self
    }

    /// Opts in to the single-probe split path.
    pub fn with_optimized_split(mut self) -> Self {
        self.optimized_split = true;
        self
    }

    pub(crate) fn arg_count(&self) -> usize {
        self.arg_oids.len()
    }

    pub(crate) fn has_split_args(&self) -> bool {
        self.split_args.iter().any(|&s| s)
    }

    pub(crate) fn validate(&self, arg_count: usize) -> Result<()> {
        if arg_count != self.arg_oids.len() {
            return Err(Error::config(format!(
                "{} expects {} arguments, got {}",
                self.name,
                self.arg_oids.len(),
                arg_count
            )));
        }
        if self.split_args.len() != self.arg_oids.len() {
            return Err(Error::config(format!(
                "{} has mismatched split-argument flags",
                self.name
            )));
        }
        if self.has_split_args() && !matches!(self.run_on, RunOn::Hash(_)) {
            return Err(Error::config(format!(
                "{} declares split arguments but does not route by hash",
                self.name
            )));
        }
        if let Some(&bad) = self
            .query
            .arg_lookup()
            .iter()
            .find(|&&idx| idx >= self.arg_oids.len())
        {
            return Err(Error::config(format!(
                "{} remote query references argument {} out of range",
                self.name, bad
            )));
        }
        Ok(())
    }
}
