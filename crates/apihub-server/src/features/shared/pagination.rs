//! Pagination query parameters
//!
//! ```rust,ignore
//! use apihub_server::features::shared::PaginationParams;
//!
//! let params = PaginationParams { limit: Some(20), offset: Some(40) };
//! let page = params.pagination();
//! ```

use apihub_common::types::Pagination;
use serde::Deserialize;

use crate::api::response::PaginationMeta;

/// `?limit=&offset=`; the limit is clamped to `1..=500`, defaulting to 50
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PaginationParams {
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

impl PaginationParams {
    pub fn pagination(&self) -> Pagination {
        Pagination::from_query(self.limit, self.offset)
    }

    /// Response metadata for a page that returned `returned` items
    pub fn meta(&self, returned: usize) -> serde_json::Value {
        let page = self.pagination();
        PaginationMeta::new(page.limit, page.offset, returned).to_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let page = PaginationParams::default().pagination();
        assert_eq!(page.limit, 50);
        assert_eq!(page.offset, 0);
    }

    #[test]
    fn test_clamping() {
        let params = PaginationParams {
            limit: Some(10_000),
            offset: Some(-5),
        };
        let page = params.pagination();
        assert_eq!(page.limit, Pagination::MAX_LIMIT);
        assert_eq!(page.offset, 0);
    }

    #[test]
    fn test_meta_reports_returned() {
        let params = PaginationParams {
            limit: Some(2),
            offset: Some(4),
        };
        let meta = params.meta(1);
        assert_eq!(meta["limit"], 2);
        assert_eq!(meta["offset"], 4);
        assert_eq!(meta["returned"], 1);
    }
}
