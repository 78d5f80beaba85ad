pub mod config;
pub mod error;
pub mod types;

pub use config::ServiceConfig;
pub use error::{FieldError, ServiceError};
pub use types::{ListParams, ListResult, SortOrder, new_id, now_rfc3339};
