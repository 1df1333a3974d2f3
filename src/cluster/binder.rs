//! Parameter binding for the selected partitions.
//!
//! Each placeholder of the remote query maps to one function argument.
//! Split arguments are encoded from the per-partition arrays the planner
//! accumulated; everything else is encoded once and the bytes shared across
//! every armed connection.

use bytes::{Bytes, BytesMut};

use crate::cluster::Cluster;
use crate::error::{Error, Result};
use crate::function::ProxyFunction;
use crate::options::ClusterOptions;
use crate::types::{self, Oid, PgValue, WireFormat};

pub(crate) fn bind_params(
    cluster: &mut Cluster,
    func: &ProxyFunction,
    args: &[PgValue],
) -> Result<()> {
    let lookup = func.query.arg_lookup();
    let mut shared: Vec<Option<Bytes>> = vec![None; args.len()];

    for (qi, &argi) in lookup.iter().enumerate() {
        let format = param_format(&cluster.options, func.arg_oids[argi]);
        for ci in 0..cluster.conn_list.len() {
            if !cluster.conn_list[ci].armed() {
                continue;
            }
            let conn = &mut cluster.conn_list[ci];
            conn.param_formats[qi] = format.code();
            conn.param_values[qi] = if args[argi].is_null() {
                None
            } else if func.split_args[argi] {
                let array = conn.split_params[argi].as_ref().ok_or_else(|| {
                    Error::internal("armed partition is missing its split parameter")
                })?;
                let mut buf = BytesMut::new();
                types::encode_array(array, format, &mut buf)?;
                Some(buf.freeze())
            } else {
                if shared[argi].is_none() {
                    let mut buf = BytesMut::new();
                    types::encode_value(&args[argi], format, &mut buf)?;
                    shared[argi] = Some(buf.freeze());
                }
                shared[argi].clone()
            };
        }
    }
    Ok(())
}

/// Parameters go binary whenever configuration allows it and the argument
/// type has a binary send encoding. Result format is decided separately at
/// submission, where the backend version match also weighs in.
fn param_format(options: &ClusterOptions, elem: Oid) -> WireFormat {
    if !options.disable_binary && types::binary_send_supported(elem) {
        WireFormat::Binary
    } else {
        WireFormat::Text
    }
}
