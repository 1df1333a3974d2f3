//! Argument values and their wire encodings.
//!
//! The engine routes values; it does not interpret them beyond what routing
//! and parameter binding need. `PgValue` covers the scalar types the engine
//! has built-in send support for, plus one-dimensional arrays of them.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

pub use postgres_protocol::Oid;

/// OIDs of the types with built-in codecs.
#[allow(missing_docs)]
pub mod oid {
    use super::Oid;

    pub const BOOL: Oid = 16;
    pub const BYTEA: Oid = 17;
    pub const INT8: Oid = 20;
    pub const INT2: Oid = 21;
    pub const INT4: Oid = 23;
    pub const TEXT: Oid = 25;
    pub const FLOAT4: Oid = 700;
    pub const FLOAT8: Oid = 701;
    pub const VARCHAR: Oid = 1043;
}

/// A caller-supplied argument value.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Array(DatumArray),
}

impl PgValue {
    /// Whether this is the SQL null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A deconstructed array argument: the element type and the elements in
/// order, with nulls represented as [`PgValue::Null`].
#[derive(Clone, Debug, PartialEq)]
pub struct DatumArray {
    /// OID of the element type.
    pub elem_oid: Oid,
    /// Number of dimensions of the source array. Arrays built by the engine
    /// are always one-dimensional.
    pub ndims: i32,
    /// The elements, in storage order.
    pub elems: Vec<PgValue>,
}

impl DatumArray {
    /// Creates an empty one-dimensional array.
    pub fn new(elem_oid: Oid) -> Self {
        Self {
            elem_oid,
            ndims: 1,
            elems: Vec::new(),
        }
    }

    /// Creates a one-dimensional array from elements.
    pub fn from_elems(elem_oid: Oid, elems: Vec<PgValue>) -> Self {
        Self {
            elem_oid,
            ndims: 1,
            elems,
        }
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.elems.len()
    }

    /// Whether the array has no elements.
    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    pub(crate) fn push(&mut self, value: PgValue) {
        self.elems.push(value);
    }
}

/// Parameter and result transfer format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WireFormat {
    Text,
    Binary,
}

impl WireFormat {
    pub(crate) fn code(self) -> i16 {
        match self {
            Self::Text => 0,
            Self::Binary => 1,
        }
    }
}

/// Whether the engine can produce a binary send encoding for the type.
pub(crate) fn binary_send_supported(elem: Oid) -> bool {
    matches!(
        elem,
        oid::BOOL
            | oid::BYTEA
            | oid::INT2
            | oid::INT4
            | oid::INT8
            | oid::TEXT
            | oid::FLOAT4
            | oid::FLOAT8
            | oid::VARCHAR
    )
}

/// Whether a result column of the type can be requested in binary. The
/// engine does not decode results, so this mirrors the send support of the
/// built-in types and is the gate callers rely on when they ask for binary
/// transfer.
pub(crate) fn binary_recv_supported(elem: Oid) -> bool {
    binary_send_supported(elem)
}

/// Encodes one non-null value in the given format, appending to `buf`.
pub(crate) fn encode_value(value: &PgValue, format: WireFormat, buf: &mut BytesMut) -> Result<()> {
    match value {
        PgValue::Null => Err(Error::internal("attempted to encode a null value")),
        PgValue::Array(array) => encode_array(array, format, buf),
        scalar => match format {
            WireFormat::Text => {
                buf.put_slice(scalar_text(scalar)?.as_bytes());
                Ok(())
            }
            WireFormat::Binary => encode_scalar_binary(scalar, buf),
        },
    }
}

fn scalar_text(value: &PgValue) -> Result<String> {
    Ok(match value {
        PgValue::Bool(true) => "t".to_string(),
        PgValue::Bool(false) => "f".to_string(),
        PgValue::Int2(v) => v.to_string(),
        PgValue::Int4(v) => v.to_string(),
        PgValue::Int8(v) => v.to_string(),
        PgValue::Float4(v) => v.to_string(),
        PgValue::Float8(v) => v.to_string(),
        PgValue::Text(v) => v.clone(),
        PgValue::Bytea(v) => format!("\\x{}", hex::encode(v)),
        PgValue::Null | PgValue::Array(_) => {
            return Err(Error::internal("not a scalar value"))
        }
    })
}

fn encode_scalar_binary(value: &PgValue, buf: &mut BytesMut) -> Result<()> {
    match value {
        PgValue::Bool(v) => buf.put_u8(*v as u8),
        PgValue::Int2(v) => buf.put_i16(*v),
        PgValue::Int4(v) => buf.put_i32(*v),
        PgValue::Int8(v) => buf.put_i64(*v),
        PgValue::Float4(v) => buf.put_f32(*v),
        PgValue::Float8(v) => buf.put_f64(*v),
        PgValue::Text(v) => buf.put_slice(v.as_bytes()),
        PgValue::Bytea(v) => buf.put_slice(v),
        PgValue::Null | PgValue::Array(_) => {
            return Err(Error::internal("not a scalar value"))
        }
    }
    Ok(())
}

/// Encodes a one-dimensional array in the given format.
pub(crate) fn encode_array(array: &DatumArray, format: WireFormat, buf: &mut BytesMut) -> Result<()> {
    if array.ndims > 1 {
        return Err(Error::internal("cannot encode a multidimensional array"));
    }
    match format {
        WireFormat::Text => encode_array_text(array, buf),
        WireFormat::Binary => encode_array_binary(array, buf),
    }
}

fn encode_array_text(array: &DatumArray, buf: &mut BytesMut) -> Result<()> {
    buf.put_u8(b'{');
    for (i, elem) in array.elems.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b',');
        }
        match elem {
            PgValue::Null => buf.put_slice(b"NULL"),
            PgValue::Array(_) => {
                return Err(Error::internal("nested arrays are not supported"))
            }
            // Quote everything; it is always valid and sidesteps the
            // delimiter and casing rules for unquoted element text.
            scalar => {
                let text = scalar_text(scalar)?;
                buf.put_u8(b'"');
                for b in text.bytes() {
                    if b == b'"' || b == b'\\' {
                        buf.put_u8(b'\\');
                    }
                    buf.put_u8(b);
                }
                buf.put_u8(b'"');
            }
        }
    }
    buf.put_u8(b'}');
    Ok(())
}

/// On-wire array layout: ndims, null bitmap flag, element OID, one
/// dimension header, then length-prefixed elements.
fn encode_array_binary(array: &DatumArray, buf: &mut BytesMut) -> Result<()> {
    let has_nulls = array.elems.iter().any(PgValue::is_null);
    buf.put_i32(1);
    buf.put_i32(has_nulls as i32);
    buf.put_u32(array.elem_oid);
    buf.put_i32(i32::try_from(array.elems.len()).map_err(|_| {
        Error::internal("array has too many elements to encode")
    })?);
    buf.put_i32(1); // lower bound
    for elem in &array.elems {
        if elem.is_null() {
            buf.put_i32(-1);
            continue;
        }
        let mut elem_buf = BytesMut::new();
        encode_scalar_binary(elem, &mut elem_buf)?;
        buf.put_i32(i32::try_from(elem_buf.len()).map_err(|_| {
            Error::internal("array element too large to encode")
        })?);
        buf.put_slice(&elem_buf);
    }
    Ok(())
}
