//! Element-wise fan-out of split array arguments.
//!
//! Every split element is routed by hashing a single-row view of the
//! arguments, and the elements landing on one partition are rebuilt into
//! per-partition arrays that replace the originals when parameters are
//! bound. The probe can run once per element or, for functions that opt in,
//! as a single query producing every `(index, hash)` pair.

use crate::cluster::{tagger, Cluster};
use crate::error::{Error, Result};
use crate::function::{ProxyFunction, RunOn};
use crate::host::HashSource;
use crate::types::{DatumArray, PgValue};

pub(crate) fn plan_split(
    cluster: &mut Cluster,
    func: &ProxyFunction,
    args: &[PgValue],
    hash: Option<&mut dyn HashSource>,
) -> Result<()> {
    let source = hash.ok_or_else(|| Error::config("hash routing requires a hash source"))?;
    let RunOn::Hash(sql) = &func.run_on else {
        return Err(Error::config(format!(
            "{} declares split arguments but does not route by hash",
            func.name
        )));
    };

    let views = split_views(func, args)?;
    let len = common_length(func, &views)?;
    if len == 0 {
        return Ok(());
    }

    if func.optimized_split {
        let rows = source.split_hash_rows(sql, args, len)?;
        for (index, value) in rows {
            if index < 1 || index as usize > len {
                return Err(Error::split(format!(
                    "split probe returned index {index}, expected 1..={len}"
                )));
            }
            let value =
                value.ok_or_else(|| Error::split("hash query returned a null value"))?;
            let part = cluster.mask(value);
            route_element(cluster, part, (index - 1) as usize, func, &views);
        }
    } else {
        for i in 0..len {
            let row_args: Vec<PgValue> = args
                .iter()
                .enumerate()
                .map(|(k, arg)| match &views[k] {
                    Some(view) => view.elems[i].clone(),
                    None => arg.clone(),
                })
                .collect();
            let rows = source.hash_rows(sql, &row_args)?;
            tagger::check_hash_cardinality(rows.len(), func)?;
            for value in rows {
                let value =
                    value.ok_or_else(|| Error::split("hash query returned a null value"))?;
                let part = cluster.mask(value);
                route_element(cluster, part, i, func, &views);
            }
        }
    }
    Ok(())
}

/// One validated array view per split argument, `None` for pass-through
/// arguments. A SQL null split argument behaves as an empty array.
fn split_views(func: &ProxyFunction, args: &[PgValue]) -> Result<Vec<Option<DatumArray>>> {
    let mut views = Vec::with_capacity(args.len());
    for (idx, arg) in args.iter().enumerate() {
        if !func.split_args[idx] {
            views.push(None);
            continue;
        }
        match arg {
            PgValue::Null => views.push(Some(DatumArray::new(func.arg_oids[idx]))),
            PgValue::Array(array) => {
                if array.ndims > 1 {
                    return Err(Error::split(format!(
                        "split argument {} of {} is multidimensional",
                        idx + 1,
                        func.name
                    )));
                }
                views.push(Some(array.clone()));
            }
            _ => {
                return Err(Error::split(format!(
                    "split argument {} of {} is not an array",
                    idx + 1,
                    func.name
                )))
            }
        }
    }
    Ok(views)
}

fn common_length(func: &ProxyFunction, views: &[Option<DatumArray>]) -> Result<usize> {
    let mut len = None;
    for view in views.iter().flatten() {
        match len {
            None => len = Some(view.len()),
            Some(expected) if expected != view.len() => {
                return Err(Error::split(format!(
                    "split arguments of {} differ in length ({} vs {})",
                    func.name,
                    expected,
                    view.len()
                )))
            }
            Some(_) => {}
        }
    }
    len.ok_or_else(|| Error::internal("no split arguments to plan"))
}

/// Routes element `i` (0-based) to the given partition. The tag a partition
/// keeps is the first index that routed to it; repeated `(partition, index)`
/// pairs are dropped while a new index still appends its elements.
fn route_element(
    cluster: &mut Cluster,
    part: usize,
    i: usize,
    func: &ProxyFunction,
    views: &[Option<DatumArray>],
) {
    let tag = (i + 1) as u32;
    let ci = cluster.part_map[part];
    let conn = &mut cluster.conn_list[ci];
    if conn.last_split_tag == tag {
        return;
    }
    conn.last_split_tag = tag;
    if conn.run_tag == 0 {
        conn.run_tag = tag;
    }
    for (k, view) in views.iter().enumerate() {
        if let Some(view) = view {
            conn.split_params[k]
                .get_or_insert_with(|| DatumArray::new(func.arg_oids[k]))
                .push(view.elems[i].clone());
        }
    }
}
