#[cfg(unix)]
use errno::Errno;

pub type Result<T> = std::result::Result<T, MappingError>;

/// Any error thrown while mapping or reprotecting memory.
#[derive(Debug, Clone)]
pub enum MappingError {
    #[cfg(unix)]
    Internal(Errno),
    #[cfg(windows)]
    Internal(u32),
    AllocationFailed,
}

#[cfg(unix)]
impl From<Errno> for MappingError {
    fn from(e: Errno) -> Self {
        MappingError::Internal(e)
    }
}

impl std::fmt::Display for MappingError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            #[cfg(unix)]
            MappingError::Internal(e) => write!(f, "mapping failed: {}", e),
            #[cfg(windows)]
            MappingError::Internal(code) => write!(f, "mapping failed: error {}", code),
            MappingError::AllocationFailed => write!(f, "could not allocate pages"),
        }
    }
}

impl std::error::Error for MappingError {}
