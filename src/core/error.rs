use std::error::Error as StdError;
use std::fmt;

use crate::core::engine::{EngineError, NodeId, ResultCode};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    Session,
    Library,
    Node,
    Parameter,
    Geometry,
    Unsupported,
    Contract,
    Io,
    Corrupt,
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    engine_code: Option<ResultCode>,
    node: Option<NodeId>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            engine_code: None,
            node: None,
            source: None,
        }
    }

    /// Wraps a failed native call, keeping its result code for the diagnostic text.
    pub fn engine(kind: ErrorKind, err: EngineError) -> Self {
        let code = err.code;
        Self::new(kind)
            .with_message(format!("engine call `{}` failed", err.call))
            .with_engine_code(code)
            .with_source(err)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn engine_code(&self) -> Option<ResultCode> {
        self.engine_code
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_engine_code(mut self, code: ResultCode) -> Self {
        self.engine_code = Some(code);
        self
    }

    pub fn with_node(mut self, node: NodeId) -> Self {
        self.node = Some(node);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(code) = self.engine_code {
            write!(f, " ({}: {})", code.raw(), code.message())?;
        }
        if let Some(node) = self.node {
            write!(f, " (node: {node})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::Session => 3,
        ErrorKind::Library => 4,
        ErrorKind::Node => 5,
        ErrorKind::Parameter => 6,
        ErrorKind::Geometry => 7,
        ErrorKind::Unsupported => 8,
        ErrorKind::Contract => 9,
        ErrorKind::Io => 10,
        ErrorKind::Corrupt => 11,
    }
}
