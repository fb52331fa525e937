#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("watchdog socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("watchdog protocol error: {0}")]
    Protocol(String),
    #[error("watchdog refused request: {code}")]
    Denied { code: i32 },
    #[error("watchdog name too long: {0}")]
    NameTooLong(String),
}

pub type Result<T> = std::result::Result<T, Error>;
