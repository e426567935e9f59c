//! Pagination types for list queries.
//!
//! These types implement Relay-style forward cursor pagination over
//! in-memory snapshots, commonly used with GraphQL.

/// Opaque cursor for pagination.
///
/// The cursor value is implementation-specific and should be treated
/// as an opaque token by clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub value: String,
}

/// Pagination parameters for list queries (forward only).
#[derive(Debug, Clone, Default)]
pub struct Pagination {
    /// Number of items to fetch.
    pub first: Option<usize>,
    /// Cursor to start after.
    pub after: Option<Cursor>,
}

/// Paginated result set with edges and page info.
#[derive(Debug, Clone)]
pub struct Connection<T> {
    /// List of edges (node + cursor pairs).
    pub edges: Vec<Edge<T>>,
    /// Information about the current page.
    pub page_info: PageInfo,
    /// Total count of items across all pages.
    pub total_count: usize,
}

/// A single item in a paginated result.
#[derive(Debug, Clone)]
pub struct Edge<T> {
    pub node: T,
    pub cursor: Cursor,
}

/// Information about the current page in a paginated result.
#[derive(Debug, Clone, Default)]
pub struct PageInfo {
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub start_cursor: Option<Cursor>,
    pub end_cursor: Option<Cursor>,
}

/// Ordering direction for sorted queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    /// Ascending order (smallest first).
    Asc,
    /// Descending order (largest first).
    #[default]
    Desc,
}

impl<T> Connection<T> {
    /// Cut one page out of an already sorted list.
    ///
    /// `cursor_of` must produce a value unique within `items`. An `after`
    /// cursor that matches nothing yields an empty page.
    pub fn paginate<F>(items: Vec<T>, pagination: &Pagination, cursor_of: F) -> Self
    where
        F: Fn(&T) -> String,
    {
        let total_count = items.len();

        let start = match &pagination.after {
            Some(after) => match items.iter().position(|item| cursor_of(item) == after.value) {
                Some(pos) => pos + 1,
                None => total_count,
            },
            None => 0,
        };
        let limit = pagination.first.unwrap_or(total_count);
        let end = start.saturating_add(limit).min(total_count);

        let edges: Vec<Edge<T>> = items
            .into_iter()
            .skip(start)
            .take(end.saturating_sub(start))
            .map(|node| {
                let cursor = Cursor {
                    value: cursor_of(&node),
                };
                Edge { node, cursor }
            })
            .collect();

        let page_info = PageInfo {
            has_next_page: end < total_count,
            has_previous_page: start > 0,
            start_cursor: edges.first().map(|e| e.cursor.clone()),
            end_cursor: edges.last().map(|e| e.cursor.clone()),
        };

        Self {
            edges,
            page_info,
            total_count,
        }
    }
}
