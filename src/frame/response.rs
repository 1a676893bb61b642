//! Response messages and their (deliberately shallow) deserialization.

use bytes::Bytes;
use num_enum::TryFromPrimitive;

use super::types;
use crate::errors::FrameError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
}

/// A database-reported error: numeric code plus a human-readable message.
#[derive(Debug, Clone)]
pub struct DbError {
    pub code: i32,
    pub message: String,
}

impl DbError {
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, FrameError> {
        let code = types::read_int(buf)?;
        let message = types::read_string(buf)?.to_owned();
        Ok(Self { code, message })
    }
}

/// The body of a RESULT response.
///
/// Row data is kept raw; the session core never interprets it.
#[derive(Debug, Clone)]
pub enum CqlResult {
    Void,
    Rows(Bytes),
    SetKeyspace(String),
    Prepared(Bytes),
    SchemaChange(Bytes),
}

impl CqlResult {
    pub fn deserialize(body: &Bytes) -> Result<Self, FrameError> {
        let mut buf = &body[..];
        let kind = types::read_int(&mut buf)?;
        let result = match kind {
            0x0001 => CqlResult::Void,
            0x0002 => CqlResult::Rows(body.slice(4..)),
            0x0003 => CqlResult::SetKeyspace(types::read_string(&mut buf)?.to_owned()),
            0x0004 => CqlResult::Prepared(Bytes::copy_from_slice(types::read_short_bytes(
                &mut buf,
            )?)),
            0x0005 => CqlResult::SchemaChange(body.slice(4..)),
            other => return Err(FrameError::UnknownResultKind(other)),
        };
        Ok(result)
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Error(DbError),
    Ready,
    Authenticate(String),
    Supported,
    Result(CqlResult),
    Event(Bytes),
}

impl Response {
    pub fn deserialize(opcode: ResponseOpcode, body: Bytes) -> Result<Response, FrameError> {
        let mut buf = &body[..];
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(DbError::deserialize(&mut buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(types::read_string(&mut buf)?.to_owned())
            }
            ResponseOpcode::Supported => Response::Supported,
            ResponseOpcode::Result => Response::Result(CqlResult::deserialize(&body)?),
            ResponseOpcode::Event => Response::Event(body),
        };
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    #[test]
    fn error_body_carries_code_and_message() {
        let mut body = Vec::new();
        types::write_int(0x1001, &mut body);
        types::write_string("coordinator overloaded", &mut body).unwrap();

        let response =
            Response::deserialize(ResponseOpcode::Error, Bytes::from(body)).unwrap();
        match response {
            Response::Error(err) => {
                assert_eq!(err.code, 0x1001);
                assert_eq!(err.message, "coordinator overloaded");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn prepared_result_exposes_the_statement_id() {
        let mut body = Vec::new();
        types::write_int(0x0004, &mut body);
        types::write_short_bytes(&[9, 9, 9], &mut body).unwrap();
        // Metadata follows in a real frame; the parser must not require it.
        body.put_u8(0xff);

        match CqlResult::deserialize(&Bytes::from(body)).unwrap() {
            CqlResult::Prepared(id) => assert_eq!(&id[..], &[9, 9, 9]),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
