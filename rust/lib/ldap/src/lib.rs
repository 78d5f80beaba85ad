//! Directory client facade.
//!
//! The directory service is reached only through [`DirectoryClient`]; every
//! failure the callers care about comes back as a typed [`LdapError`]
//! variant. [`MemoryDirectory`] is the embedded implementation.

pub mod dn;
pub mod error;
pub mod memory;
pub mod traits;

pub use error::LdapError;
pub use memory::MemoryDirectory;
pub use traits::{Attributes, DirectoryClient, Entry, Filter, Modification};
