use std::{fmt, io};

#[derive(Debug)]
pub enum ShmqError {
    SharedMemory(shared_memory::ShmemError),
    Io(io::Error),
    Logic(String),
}

impl fmt::Display for ShmqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShmqError::SharedMemory(e) => write!(f, "Shared memory error: {}", e),
            ShmqError::Io(e) => write!(f, "IO error: {}", e),
            ShmqError::Logic(s) => write!(f, "Logic error: {}", s),
        }
    }
}

impl std::error::Error for ShmqError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShmqError::SharedMemory(e) => Some(e),
            ShmqError::Io(e) => Some(e),
            ShmqError::Logic(_) => None,
        }
    }
}

impl From<shared_memory::ShmemError> for ShmqError {
    fn from(err: shared_memory::ShmemError) -> Self {
        ShmqError::SharedMemory(err)
    }
}

impl From<io::Error> for ShmqError {
    fn from(err: io::Error) -> Self {
        ShmqError::Io(err)
    }
}
