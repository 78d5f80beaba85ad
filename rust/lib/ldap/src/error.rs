use thiserror::Error;

/// Typed outcomes of directory operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LdapError {
    /// The value being added is already held by the attribute.
    #[error("attribute value exists: {attribute}={value} on {dn}")]
    AlreadyPresent {
        dn: String,
        attribute: String,
        value: String,
    },

    /// The value being removed is not held by the attribute.
    #[error("no such attribute value: {attribute}={value} on {dn}")]
    NoSuchAttribute {
        dn: String,
        attribute: String,
        value: String,
    },

    /// The change would leave the entry violating its object class rules.
    #[error("schema violation on {dn}: {reason}")]
    SchemaViolation { dn: String, reason: String },

    #[error("entry already exists: {0}")]
    AlreadyBound(String),

    #[error("no such object: {0}")]
    NoSuchObject(String),

    #[error("operation not allowed on non-leaf: {0}")]
    NotAllowedOnNonLeaf(String),

    #[error("directory error: {0}")]
    Other(String),
}
