//! Frontend message construction and error-payload extraction.

use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use fallible_iterator::FallibleIterator;
use postgres_protocol::message::backend::{ErrorResponseBody, NoticeResponseBody};
use postgres_protocol::message::frontend;
use postgres_protocol::IsNull;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::{Error, RemoteError, Result};
use crate::host::Notice;

/// Appends the startup packet for the given session parameters.
pub(crate) fn startup(params: &[(String, String)], buf: &mut BytesMut) -> Result<()> {
    frontend::startup_message(params.iter().map(|(k, v)| (k.as_str(), v.as_str())), buf)
        .map_err(|e| Error::protocol(format!("could not encode startup packet: {e}")))
}

/// Appends an unnamed parse/bind/execute/sync sequence for one parameterized
/// query. Parameter types are left to the backend to infer from the call
/// site, matching how the remote function signature is declared there.
pub(crate) fn extended_query(
    sql: &str,
    values: &[Option<Bytes>],
    formats: &[i16],
    result_format: i16,
    buf: &mut BytesMut,
) -> Result<()> {
    frontend::parse("", sql, std::iter::empty(), buf)
        .map_err(|e| Error::protocol(format!("could not encode parse message: {e}")))?;
    frontend::bind(
        "",
        "",
        formats.iter().copied(),
        values.iter(),
        |value, buf| match value {
            Some(bytes) => {
                buf.extend_from_slice(bytes);
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        },
        std::iter::once(result_format),
        buf,
    )
    .map_err(|e| match e {
        frontend::BindError::Conversion(e) => {
            Error::protocol(format!("could not convert parameter: {e}"))
        }
        frontend::BindError::Serialization(e) => {
            Error::protocol(format!("could not encode bind message: {e}"))
        }
    })?;
    frontend::describe(b'P', "", buf)
        .map_err(|e| Error::protocol(format!("could not encode describe message: {e}")))?;
    frontend::execute("", 0, buf)
        .map_err(|e| Error::protocol(format!("could not encode execute message: {e}")))?;
    frontend::sync(buf);
    Ok(())
}

/// Appends a simple query, used for session tuning statements.
pub(crate) fn simple_query(sql: &str, buf: &mut BytesMut) -> Result<()> {
    frontend::query(sql, buf)
        .map_err(|e| Error::protocol(format!("could not encode query message: {e}")))
}

/// Sends a CancelRequest for the given backend over a fresh connection.
pub(crate) async fn send_cancel(
    addr: SocketAddr,
    process_id: i32,
    secret_key: i32,
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    frontend::cancel_request(process_id, secret_key, &mut buf);
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(&buf).await?;
    stream.shutdown().await
}

/// Collected fields of an error or notice payload.
#[derive(Default)]
struct Fields {
    severity: String,
    code: String,
    message: String,
    detail: Option<String>,
    hint: Option<String>,
}

fn collect_fields<'a>(
    mut iter: impl FallibleIterator<Item = postgres_protocol::message::backend::ErrorField<'a>, Error = std::io::Error>,
) -> Result<Fields> {
    let mut fields = Fields::default();
    while let Some(field) = iter
        .next()
        .map_err(|e| Error::protocol(format!("malformed error payload: {e}")))?
    {
        let value = field.value().to_string();
        match field.type_() {
            b'S' => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            _ => {}
        }
    }
    Ok(fields)
}

/// Surfaces a backend ErrorResponse as a remote error tagged with the
/// executing function.
pub(crate) fn remote_error(body: &ErrorResponseBody, function: &str) -> Error {
    match collect_fields(body.fields()) {
        Ok(fields) => Error::new(crate::error::ErrorKind::Remote(RemoteError {
            function: function.to_string(),
            severity: fields.severity,
            code: fields.code,
            message: fields.message,
            detail: fields.detail,
            hint: fields.hint,
        })),
        Err(e) => e,
    }
}

/// Converts a backend NoticeResponse into the host-facing notice form.
pub(crate) fn notice(body: &NoticeResponseBody, function: &str) -> Result<Notice> {
    let fields = collect_fields(body.fields())?;
    Ok(Notice {
        function: function.to_string(),
        severity: fields.severity,
        code: fields.code,
        message: fields.message,
    })
}
