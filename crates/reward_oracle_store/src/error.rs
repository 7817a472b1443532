use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    InvalidEntity { entity: String },
    Io { path: String, message: String },
    Decode { source: String, message: String },
    Encode { message: String },
    Http { message: String },
    HttpStatus { code: u16, message: String },
    Unavailable { reason: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::InvalidEntity { entity } => {
                write!(f, "invalid entity id: {entity:?}")
            }
            StoreError::Io { path, message } => write!(f, "store io failed ({path}): {message}"),
            StoreError::Decode { source, message } => {
                write!(f, "decode stored record failed ({source}): {message}")
            }
            StoreError::Encode { message } => write!(f, "encode record failed: {message}"),
            StoreError::Http { message } => write!(f, "store request failed: {message}"),
            StoreError::HttpStatus { code, message } => {
                write!(f, "store http status {code}: {message}")
            }
            StoreError::Unavailable { reason } => write!(f, "store unavailable: {reason}"),
        }
    }
}

impl std::error::Error for StoreError {}
