use std::fmt;

use crate::validator::ValidationError;

/// Errors raised while decoding, validating, migrating or encoding a value.
///
/// None of these are fatal: read-path callers substitute a default, write-path
/// callers leave the previously stored value untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    /// Stored text is not a `{"version", "payload"}` envelope.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Codec failed outside the envelope itself.
    #[error("codec `{codec}` failed: {message}")]
    CodecError { codec: &'static str, message: String },

    /// Stored version has no registered schema (strict mode).
    #[error("no schema registered for `{key}` at v{version}")]
    SchemaNotFound { key: String, version: u32 },

    /// Write requested a version with no schema while the key has schemas.
    #[error("write of `{key}` at v{version} requires a registered schema")]
    WriteSchemaRequired { key: String, version: u32 },

    /// No contiguous chain of migration rules exists.
    #[error("no migration path for `{key}` from v{from} to v{to}")]
    MigrationPathNotFound { key: String, from: u32, to: u32 },

    /// A migration transform returned an error.
    #[error("migration of `{key}` v{from}→v{to} failed: {reason}")]
    MigrationFailed {
        key: String,
        from: u32,
        to: u32,
        reason: String,
    },

    /// Value does not satisfy the schema it is being read or written under.
    #[error("`{key}` does not match schema v{version}: {}", summarize(.errors))]
    TypeMismatch {
        key: String,
        version: u32,
        errors: Vec<ValidationError>,
    },

    /// `(key, version)` is already registered with a different body.
    #[error("schema `{key}` v{version} already registered with a different body")]
    RegistrationConflict { key: String, version: u32 },

    /// The selected mode cannot work with the supplied collaborators.
    #[error("invalid mode configuration: {0}")]
    ModeConfigurationInvalid(String),

    /// Version 0 is reserved for codec-only values.
    #[error("schema `{key}` cannot be registered at reserved version 0")]
    ReservedVersion { key: String },

    /// A migration rule that points backwards.
    #[error("migration rule for `{key}` goes backwards (v{from}→v{to})")]
    InvalidMigrationRule { key: String, from: u32, to: u32 },

    /// A schema body that cannot be compiled (e.g. a bad pattern).
    #[error("schema `{key}` v{version} is invalid: {message}")]
    InvalidSchema {
        key: String,
        version: u32,
        message: String,
    },

    /// Configuration or schema file could not be parsed.
    #[error("config error: {0}")]
    Config(String),

    /// Configuration or schema file could not be read.
    #[error("io error: {0}")]
    Io(String),
}

/// Discriminant of [`Error`] for callers that branch or count by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidEnvelope,
    CodecError,
    SchemaNotFound,
    WriteSchemaRequired,
    MigrationPathNotFound,
    MigrationFailed,
    TypeMismatch,
    RegistrationConflict,
    ModeConfigurationInvalid,
    ReservedVersion,
    InvalidMigrationRule,
    InvalidSchema,
    Config,
    Io,
}

impl Error {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidEnvelope(_) => ErrorKind::InvalidEnvelope,
            Self::CodecError { .. } => ErrorKind::CodecError,
            Self::SchemaNotFound { .. } => ErrorKind::SchemaNotFound,
            Self::WriteSchemaRequired { .. } => ErrorKind::WriteSchemaRequired,
            Self::MigrationPathNotFound { .. } => ErrorKind::MigrationPathNotFound,
            Self::MigrationFailed { .. } => ErrorKind::MigrationFailed,
            Self::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            Self::RegistrationConflict { .. } => ErrorKind::RegistrationConflict,
            Self::ModeConfigurationInvalid(_) => ErrorKind::ModeConfigurationInvalid,
            Self::ReservedVersion { .. } => ErrorKind::ReservedVersion,
            Self::InvalidMigrationRule { .. } => ErrorKind::InvalidMigrationRule,
            Self::InvalidSchema { .. } => ErrorKind::InvalidSchema,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

fn summarize(errors: &[ValidationError]) -> String {
    match errors {
        [] => "no details".into(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{first} (+{} more)", rest.len()),
    }
}

/// Result alias for schema operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let err = Error::MigrationPathNotFound {
            key: "count".into(),
            from: 1,
            to: 3,
        };
        assert_eq!(err.kind(), ErrorKind::MigrationPathNotFound);
        assert_eq!(err.to_string(), "no migration path for `count` from v1 to v3");
    }

    #[test]
    fn type_mismatch_summarizes_first_error() {
        let err = Error::TypeMismatch {
            key: "count".into(),
            version: 1,
            errors: vec![
                ValidationError::new("", "type", "expected number, found string"),
                ValidationError::new("/a", "type", "expected number, found null"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("expected number, found string"));
        assert!(msg.contains("+1 more"));
    }
}
