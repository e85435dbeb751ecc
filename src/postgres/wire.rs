//! The slice of the v3 frontend/backend protocol a pooled client needs:
//! startup, password and SASL auth, simple query and terminate.

use bytes::{Buf, BufMut, BytesMut};
use md5::Context;
use memchr::memchr;
use std::str;

use crate::engine::Row;
use crate::errors::BackendError;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const PROTOCOL_VERSION: u32 = 196608;

pub const AUTH_OK: i32 = 0;
pub const AUTH_CLEARTEXT: i32 = 3;
pub const AUTH_MD5: i32 = 5;
pub const AUTH_SASL: i32 = 10;
pub const AUTH_SASL_CONTINUE: i32 = 11;
pub const AUTH_SASL_FINAL: i32 = 12;

pub const TERMINATE: [u8; 5] = [b'X', 0, 0, 0, 4];

// -----------------------------------------------------------------------------
// ----- Framing ---------------------------------------------------------------

/// Tag and declared length of the complete frame at the front of `bytes`,
/// or `None` while the frame is still partial.
pub fn peek_backend(bytes: &[u8]) -> Option<(u8, usize)> {
    if bytes.len() < 5 {
        return None;
    }

    let tag = bytes[0];
    let len = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
    if len < 4 {
        return None;
    }

    if bytes.len() < 1 + len {
        return None;
    }

    Some((tag, len))
}

/// Read a NUL-terminated UTF-8 string and advance past the terminator.
pub fn read_cstr<'a>(input: &mut &'a [u8]) -> Result<&'a str, BackendError> {
    let unread = *input;
    let nul = memchr(0, unread).ok_or_else(|| BackendError::protocol("missing NUL terminator"))?;

    let (before, from_nul) = unread.split_at(nul);
    *input = &from_nul[1..];

    str::from_utf8(before).map_err(|e| BackendError::protocol(format!("invalid UTF-8: {e}")))
}

fn need(body: &[u8], n: usize, what: &str) -> Result<(), BackendError> {
    if body.remaining() < n {
        return Err(BackendError::protocol(format!("{what} truncated")));
    }
    Ok(())
}

// -----------------------------------------------------------------------------
// ----- Frontend messages -----------------------------------------------------

pub fn build_startup_message(user: &str, database: &str, application_name: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128);
    buf.put_u32(0);
    buf.put_u32(PROTOCOL_VERSION);

    for (key, value) in [
        ("user", user),
        ("database", database),
        ("application_name", application_name),
    ] {
        buf.extend_from_slice(key.as_bytes());
        buf.put_u8(0);
        buf.extend_from_slice(value.as_bytes());
        buf.put_u8(0);
    }
    buf.put_u8(0);

    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    buf
}

pub fn build_password_message(password: &str) -> BytesMut {
    tagged_cstr(b'p', password)
}

pub fn build_query_message(sql: &str) -> BytesMut {
    tagged_cstr(b'Q', sql)
}

pub fn build_sasl_initial_response(mechanism: &str, data: &str) -> BytesMut {
    let payload_len = 4 + mechanism.len() + 1 + 4 + data.len();
    let mut buf = BytesMut::with_capacity(1 + payload_len);
    buf.put_u8(b'p');
    buf.put_u32(payload_len as u32);
    buf.extend_from_slice(mechanism.as_bytes());
    buf.put_u8(0);
    buf.put_i32(data.len() as i32);
    buf.extend_from_slice(data.as_bytes());
    buf
}

pub fn build_sasl_response(data: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + data.len());
    buf.put_u8(b'p');
    buf.put_u32(4 + data.len() as u32);
    buf.extend_from_slice(data.as_bytes());
    buf
}

fn tagged_cstr(tag: u8, value: &str) -> BytesMut {
    let payload_len = 4 + value.len() + 1;
    let mut buf = BytesMut::with_capacity(1 + payload_len);
    buf.put_u8(tag);
    buf.put_u32(payload_len as u32);
    buf.extend_from_slice(value.as_bytes());
    buf.put_u8(0);
    buf
}

/// `"md5" || hex(md5(hex(md5(password || user)) || salt))`
pub fn md5_password(user: &str, password: &str, salt: [u8; 4]) -> String {
    let mut inner = Context::new();
    inner.consume(password.as_bytes());
    inner.consume(user.as_bytes());
    let inner = format!("{:x}", inner.compute());

    let mut outer = Context::new();
    outer.consume(inner.as_bytes());
    outer.consume(salt);
    format!("md5{:x}", outer.compute())
}

// -----------------------------------------------------------------------------
// ----- Backend messages ------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
pub enum AuthRequest<'a> {
    Ok,
    Cleartext,
    Md5([u8; 4]),
    /// Mechanisms the server offers, in its order of preference.
    Sasl(Vec<&'a str>),
    SaslContinue(&'a str),
    SaslFinal(&'a str),
    Other(i32),
}

pub fn parse_auth_request(mut body: &[u8]) -> Result<AuthRequest<'_>, BackendError> {
    need(body, 4, "authentication request")?;
    let code = body.get_i32();

    match code {
        AUTH_OK => Ok(AuthRequest::Ok),
        AUTH_CLEARTEXT => Ok(AuthRequest::Cleartext),
        AUTH_MD5 => {
            need(body, 4, "md5 salt")?;
            let mut salt = [0u8; 4];
            body.copy_to_slice(&mut salt);
            Ok(AuthRequest::Md5(salt))
        }
        AUTH_SASL => {
            let mut mechanisms = Vec::new();
            loop {
                let mechanism = read_cstr(&mut body)?;
                if mechanism.is_empty() {
                    break;
                }
                mechanisms.push(mechanism);
            }
            Ok(AuthRequest::Sasl(mechanisms))
        }
        AUTH_SASL_CONTINUE => Ok(AuthRequest::SaslContinue(sasl_data(body)?)),
        AUTH_SASL_FINAL => Ok(AuthRequest::SaslFinal(sasl_data(body)?)),
        other => Ok(AuthRequest::Other(other)),
    }
}

fn sasl_data(body: &[u8]) -> Result<&str, BackendError> {
    str::from_utf8(body).map_err(|e| BackendError::protocol(format!("invalid UTF-8 in SASL data: {e}")))
}

pub fn parse_parameter_status(mut body: &[u8]) -> Result<(&str, &str), BackendError> {
    let name = read_cstr(&mut body)?;
    let value = read_cstr(&mut body)?;
    Ok((name, value))
}

/// Decode an ErrorResponse into [`BackendError::Server`]. Fields other than
/// severity, SQLSTATE and message are skipped.
pub fn parse_error_response(mut body: &[u8]) -> Result<BackendError, BackendError> {
    let mut severity = None;
    let mut localized = None;
    let mut code = None;
    let mut message = None;

    while body.has_remaining() {
        let field = body.get_u8();
        if field == 0 {
            break;
        }
        let value = read_cstr(&mut body)?;
        match field {
            b'V' => severity = Some(value),
            b'S' => localized = Some(value),
            b'C' => code = Some(value),
            b'M' => message = Some(value),
            _ => {}
        }
    }

    Ok(BackendError::Server {
        severity: severity.or(localized).unwrap_or("ERROR").to_string(),
        code: code.unwrap_or("XX000").to_string(),
        message: message.unwrap_or_default().to_string(),
    })
}

pub fn parse_row_description(mut body: &[u8]) -> Result<Vec<String>, BackendError> {
    need(body, 2, "row description")?;
    let count = body.get_i16().max(0) as usize;

    let mut columns = Vec::with_capacity(count);
    for _ in 0..count {
        columns.push(read_cstr(&mut body)?.to_string());
        // table oid, column attr, type oid, type len, type modifier, format
        need(body, 18, "field description")?;
        body.advance(18);
    }
    Ok(columns)
}

pub fn parse_data_row(mut body: &[u8]) -> Result<Row, BackendError> {
    need(body, 2, "data row")?;
    let count = body.get_i16().max(0) as usize;

    let mut row = Row::with_capacity(count);
    for _ in 0..count {
        need(body, 4, "column length")?;
        let len = body.get_i32();
        if len < 0 {
            row.push(None);
            continue;
        }

        let len = len as usize;
        need(body, len, "column value")?;
        let value = str::from_utf8(&body[..len])
            .map_err(|e| BackendError::protocol(format!("invalid UTF-8 in column: {e}")))?;
        row.push(Some(value.to_string()));
        body.advance(len);
    }
    Ok(row)
}

pub fn parse_command_complete(mut body: &[u8]) -> Result<String, BackendError> {
    Ok(read_cstr(&mut body)?.to_string())
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------


// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
