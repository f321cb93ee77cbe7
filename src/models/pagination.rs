use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Page/limit query parameters. Missing values fall back to the first page
/// of `DEFAULT_LIMIT` items.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, JsonSchema)]
pub struct PaginationParams {
    /// Page number (1-indexed)
    pub page: Option<i64>,
    /// Number of items per page
    pub limit: Option<i64>,
}

impl PaginationParams {
    pub const DEFAULT_LIMIT: i64 = 50;
    pub const MAX_LIMIT: i64 = 200;
    /// Highest page served; larger requests read this page, which is empty
    /// for any realistic table.
    pub const MAX_PAGE: i64 = 1_000_000;

    pub fn new(page: Option<i64>, limit: Option<i64>) -> Self {
        Self { page, limit }
    }

    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).clamp(1, Self::MAX_PAGE)
    }

    /// Capped limit, so page boundaries stay consistent.
    pub fn effective_limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1) * self.effective_limit()
    }
}

/// Paginated response wrapper with metadata
#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub page: i64,
    pub limit: i64,
    pub total_items: i64,
    pub total_pages: i64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(data: Vec<T>, params: &PaginationParams, total_items: i64) -> Self {
        let limit = params.effective_limit();
        let total_pages = (total_items + limit - 1) / limit;

        Self {
            data,
            page: params.page(),
            limit,
            total_items,
            total_pages,
        }
    }
}
