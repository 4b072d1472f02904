//! Ordered middleware composition
//!
//! A filter decorates a router with one layer. Filters are collected in the
//! order they should see a request and folded onto the terminal handler
//! once, when the router is built. axum runs the most recently applied
//! layer first, so the fold walks the list backwards.

use axum::Router;

/// One middleware layer applied to a router
pub type Filter = Box<dyn FnOnce(Router) -> Router + Send>;

#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Filter>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `filter`; it runs after every filter added before it.
    pub fn use_filter<F>(mut self, filter: F) -> Self
    where
        F: FnOnce(Router) -> Router + Send + 'static,
    {
        self.filters.push(Box::new(filter));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Wrap `handler` so the first filter added is the outermost layer
    pub fn build(self, handler: Router) -> Router {
        self.filters
            .into_iter()
            .rev()
            .fold(handler, |router, filter| filter(router))
    }
}
