//! Request messages understood by the server.

use bytes::{BufMut, Bytes};
use num_enum::TryFromPrimitive;
use std::collections::HashMap;

use super::types;
use crate::errors::FrameError;
use crate::statement::Consistency;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Credentials = 0x04,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
}

pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), FrameError>;

    fn to_bytes(&self) -> Result<Bytes, FrameError> {
        let mut v = Vec::new();
        self.serialize(&mut v)?;
        Ok(v.into())
    }
}

pub struct Startup {
    pub options: HashMap<String, String>,
}

impl Startup {
    pub fn new() -> Self {
        let mut options = HashMap::new();
        options.insert("CQL_VERSION".to_owned(), "3.0.0".to_owned());
        Self { options }
    }
}

impl Default for Startup {
    fn default() -> Self {
        Self::new()
    }
}

impl SerializableRequest for Startup {
    const OPCODE: RequestOpcode = RequestOpcode::Startup;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), FrameError> {
        types::write_string_map(&self.options, buf)
    }
}

/// Answer to an AUTHENTICATE challenge, carrying the opaque credentials.
pub struct CredentialsRequest<'a> {
    pub credentials: &'a HashMap<String, String>,
}

impl SerializableRequest for CredentialsRequest<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Credentials;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), FrameError> {
        types::write_string_map(self.credentials, buf)
    }
}

pub struct Query<'a> {
    pub contents: &'a str,
    pub consistency: Consistency,
}

impl SerializableRequest for Query<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Query;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), FrameError> {
        types::write_long_string(self.contents, buf)?;
        types::write_short(self.consistency as u16, buf);
        Ok(())
    }
}

pub struct Prepare<'a> {
    pub contents: &'a str,
}

impl SerializableRequest for Prepare<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Prepare;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), FrameError> {
        types::write_long_string(self.contents, buf)
    }
}

pub struct Execute<'a> {
    pub id: &'a [u8],
    pub values: &'a [Option<Vec<u8>>],
    pub consistency: Consistency,
}

impl SerializableRequest for Execute<'_> {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut impl BufMut) -> Result<(), FrameError> {
        types::write_short_bytes(self.id, buf)?;
        if self.values.len() > u16::MAX as usize {
            return Err(FrameError::ValueTooLong(self.values.len()));
        }
        types::write_short(self.values.len() as u16, buf);
        for value in self.values {
            types::write_bytes_opt(value.as_deref(), buf)?;
        }
        types::write_short(self.consistency as u16, buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_body_layout() {
        let execute = Execute {
            id: &[0xca, 0xfe],
            values: &[Some(vec![1, 2, 3]), None],
            consistency: Consistency::Quorum,
        };
        let body = execute.to_bytes().unwrap();

        let mut buf = &body[..];
        assert_eq!(types::read_short_bytes(&mut buf).unwrap(), &[0xca, 0xfe]);
        assert_eq!(types::read_short(&mut buf).unwrap(), 2);
        assert_eq!(types::read_int(&mut buf).unwrap(), 3); // first value length
    }
}
