use std::path::PathBuf;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The cipher's padding check failed. Expected for members that were never encrypted.
    #[error("invalid block padding")]
    Padding,

    #[error("cipher rejected the key")]
    InvalidKey,

    #[error("unsupported path scheme in {0:?}")]
    UnsupportedScheme(String),

    #[error("malformed reference {reference:?}: {reason}")]
    MalformedReference {
        reference: String,
        reason: &'static str,
    },

    #[error("required member {0:?} is missing from the backup")]
    MissingRequiredMember(String),

    #[error("{0:?} not found")]
    NotFound(String),

    #[error("manifest lists {0:?} but the file does not exist")]
    ManifestMismatch(String),

    #[error("{0:?} is not listed in the manifest")]
    UnlistedFile(String),

    #[error("more than one manifest found: {0:?}")]
    DuplicateManifest(Vec<PathBuf>),

    #[error("member name {0:?} escapes the export directory")]
    UnsafeMemberName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("malformed record: {0}")]
    Record(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Zip(#[from] zip::result::ZipError),

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error("database: {0}")]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub(crate) fn malformed(reference: &str, reason: &'static str) -> Self {
        Error::MalformedReference {
            reference: reference.to_string(),
            reason,
        }
    }
}
