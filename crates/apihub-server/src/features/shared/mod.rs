//! Helpers shared by the feature slices
//!
//! - **pagination**: `limit`/`offset` query parameters
//! - **request**: caller identity and path parameter parsing

pub mod pagination;
pub mod request;

pub use pagination::PaginationParams;
pub use request::{parse_api_type, user_id, USER_HEADER};
