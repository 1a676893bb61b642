//! CQL statements.

use bytes::Bytes;

/// Consistency level attached to a statement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    #[default]
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
}

/// An unprepared CQL statement.
///
/// The session does not parse the contents; the text is shipped to the
/// server verbatim.
#[derive(Debug, Clone)]
pub struct Statement {
    pub contents: String,
    pub consistency: Consistency,
}

impl Statement {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            consistency: Consistency::default(),
        }
    }

    /// Sets the consistency level, returning the modified statement.
    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }
}

impl From<&str> for Statement {
    fn from(contents: &str) -> Self {
        Self::new(contents)
    }
}

impl From<String> for Statement {
    fn from(contents: String) -> Self {
        Self::new(contents)
    }
}

/// Handle to a statement prepared on some connection.
///
/// The id is the server-assigned identifier; which connections know it is
/// tracked by the connections themselves.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    id: Bytes,
    contents: String,
    pub consistency: Consistency,
}

impl PreparedStatement {
    pub(crate) fn new(id: Bytes, contents: String, consistency: Consistency) -> Self {
        Self {
            id,
            contents,
            consistency,
        }
    }

    pub fn id(&self) -> &Bytes {
        &self.id
    }

    /// The statement text this handle was prepared from.
    pub fn contents(&self) -> &str {
        &self.contents
    }
}
