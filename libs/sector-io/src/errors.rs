use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// The operation missed its deadline. The buffer involved has been
    /// abandoned to the blocking task and must not be reused.
    #[error("i/o timed out after {timeout:?} on {path}")]
    Timeout { path: String, timeout: Duration },
    #[error("offset {offset} / len {len} not aligned to sector size {sector_size} on {path}")]
    Misaligned {
        path: String,
        offset: u64,
        len: usize,
        sector_size: u32,
    },
    #[error("i/o worker failed: {0}")]
    TaskFailed(String),
    #[error("unsupported sector size {0}")]
    SectorSize(u32),
}

impl Error {
    /// Timed-out i/o is handled differently from failed i/o everywhere
    /// above this layer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let timeout = Error::Timeout {
            path: "/dev/sdx".into(),
            timeout: Duration::from_secs(10),
        };
        assert!(timeout.is_timeout());

        let io = Error::Io {
            path: "/dev/sdx".into(),
            source: std::io::Error::from_raw_os_error(libc::EIO),
        };
        assert!(!io.is_timeout());
    }
}
