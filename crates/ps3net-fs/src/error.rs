use thiserror::Error;

pub type Result<T> = std::result::Result<T, FsError>;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a directory")]
    NotDirectory,

    #[error("corrupt encrypted image: {0}")]
    CorruptEncryptedImage(&'static str),

    #[error("invalid key file")]
    InvalidKeyFile,

    #[error("corrupt PARAM.SFO: {0}")]
    CorruptSfo(&'static str),

    #[error("PARAM.SFO field not found: {0}")]
    SfoFieldMissing(&'static str),

    #[error("unusable TITLE_ID: {0:?}")]
    BadTitleId(String),

    #[error("identifier too long: {0:?}")]
    IdentifierTooLong(String),
}

impl FsError {
    /// "Not found" in the sense clients observe it: escapes of the confined
    /// root are reported exactly like missing paths.
    pub(crate) fn not_found() -> FsError {
        FsError::Io(std::io::Error::from(std::io::ErrorKind::NotFound))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::Io(err) if err.kind() == std::io::ErrorKind::NotFound)
    }
}
