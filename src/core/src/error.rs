use thiserror::Error;

/// Semantic error kinds, independent of where the failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Ambiguous,
    AlreadyExists,
    Unauthorized,
    SchemeMismatch,
    RegistryUnreachable,
    FetchFailed,
    PushFailed,
    SignatureInvalid,
    IntegrityError,
    Unsupported,
    Canceled,
    DeadlineExceeded,
    EncryptionFailed,
    DecryptionFailed,
    NoInput,
    Io,
    Internal,
}

/// Cask error types
#[derive(Error, Debug)]
pub enum CaskError {
    /// Malformed input or incompatible flag combination
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unparseable image reference
    #[error("invalid reference format \"{reference}\": {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Malformed `algo:hex` digest
    #[error("invalid digest \"{0}\"")]
    InvalidDigest(String),

    /// No image, blob or reference target
    #[error("{0}: not found")]
    NotFound(String),

    /// Several candidates for an operation that needs exactly one
    #[error("multiple IDs found with provided prefix \"{query}\" ({count} matches)")]
    Ambiguous { query: String, count: usize },

    /// The record or blob already exists
    #[error("{0}: already exists")]
    AlreadyExists(String),

    /// Registry rejected the credentials
    #[error("unauthorized: {registry} - {message}")]
    Unauthorized { registry: String, message: String },

    /// HTTPS was attempted against a plain-HTTP registry (or the reverse)
    #[error("scheme mismatch: {registry} - {message}")]
    SchemeMismatch { registry: String, message: String },

    /// Registry could not be reached at all
    #[error("registry unreachable: {registry} - {message}")]
    RegistryUnreachable { registry: String, message: String },

    /// Content could not be fetched
    #[error("failed to fetch {reference}: {message}")]
    FetchFailed { reference: String, message: String },

    /// Content could not be pushed
    #[error("failed to push {reference}: {message}")]
    PushFailed { reference: String, message: String },

    /// cosign/notation verification failed
    #[error("signature verification failed: {message}")]
    SignatureInvalid { message: String, cosign_mismatch: bool },

    /// Computed digest or size does not match the descriptor
    #[error("integrity check failed for {digest}: {message}")]
    IntegrityError { digest: String, message: String },

    /// Feature not available in this build or environment
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The operation was canceled
    #[error("operation canceled: {0}")]
    Canceled(String),

    /// The operation ran past its deadline
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// Layer encryption failed
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),

    /// Layer decryption failed
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    /// Nothing to read on the input stream
    #[error("no input: {0}")]
    NoInput(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// An error wrapped with the failed operation and the offending reference
    #[error("{op} {reference}: {source}")]
    Context {
        op: String,
        reference: String,
        #[source]
        source: Box<CaskError>,
    },

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl CaskError {
    /// The semantic kind of this error. Wrapped errors report their source's kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaskError::InvalidArgument(_)
            | CaskError::InvalidReference { .. }
            | CaskError::InvalidDigest(_) => ErrorKind::InvalidArgument,
            CaskError::NotFound(_) => ErrorKind::NotFound,
            CaskError::Ambiguous { .. } => ErrorKind::Ambiguous,
            CaskError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            CaskError::Unauthorized { .. } => ErrorKind::Unauthorized,
            CaskError::SchemeMismatch { .. } => ErrorKind::SchemeMismatch,
            CaskError::RegistryUnreachable { .. } => ErrorKind::RegistryUnreachable,
            CaskError::FetchFailed { .. } => ErrorKind::FetchFailed,
            CaskError::PushFailed { .. } => ErrorKind::PushFailed,
            CaskError::SignatureInvalid { .. } => ErrorKind::SignatureInvalid,
            CaskError::IntegrityError { .. } => ErrorKind::IntegrityError,
            CaskError::Unsupported(_) => ErrorKind::Unsupported,
            CaskError::Canceled(_) => ErrorKind::Canceled,
            CaskError::DeadlineExceeded(_) => ErrorKind::DeadlineExceeded,
            CaskError::EncryptionFailed(_) => ErrorKind::EncryptionFailed,
            CaskError::DecryptionFailed(_) => ErrorKind::DecryptionFailed,
            CaskError::NoInput(_) => ErrorKind::NoInput,
            CaskError::Io(_) => ErrorKind::Io,
            CaskError::Serialization(_) | CaskError::Config(_) | CaskError::Other(_) => {
                ErrorKind::Internal
            }
            CaskError::Context { source, .. } => source.kind(),
        }
    }

    /// True if this error (or the error it wraps) is of the given kind.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    /// Process exit code for this error: 12 for a cosign mismatch, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            CaskError::SignatureInvalid {
                cosign_mismatch: true,
                ..
            } => 12,
            CaskError::Context { source, .. } => source.exit_code(),
            _ => 1,
        }
    }

    /// Shorthand for a `NotFound` error.
    pub fn not_found(what: impl Into<String>) -> Self {
        CaskError::NotFound(what.into())
    }

    /// Shorthand for an `InvalidArgument` error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        CaskError::InvalidArgument(msg.into())
    }
}

impl From<serde_json::Error> for CaskError {
    fn from(err: serde_json::Error) -> Self {
        CaskError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for CaskError {
    fn from(err: serde_yaml::Error) -> Self {
        CaskError::Serialization(err.to_string())
    }
}

/// Result type alias for cask operations
pub type Result<T> = std::result::Result<T, CaskError>;

/// Wraps failures with the operation name and the reference it was acting on.
pub trait ResultExt<T> {
    fn context(self, op: &str, reference: &str) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, op: &str, reference: &str) -> Result<T> {
        self.map_err(|e| CaskError::Context {
            op: op.to_string(),
            reference: reference.to_string(),
            source: Box::new(e),
        })
    }
}
