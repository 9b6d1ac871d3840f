//! Request and response filters

use crate::models::{HttpRequest, HttpResponse};
use std::collections::HashMap;
use std::sync::Arc;

/// Inspects client requests before they are proxied.
pub trait RequestFilter: Send + Sync {
    /// May rewrite `request` in place. Returning a response answers the
    /// client directly and the request is not proxied.
    fn filter(&self, request: &mut HttpRequest) -> Option<HttpResponse>;
}

/// Rewrites complete responses. The body is buffered up to
/// [`ResponseFilter::max_response_size`] before the filter runs.
pub trait ResponseFilter: Send + Sync {
    fn filter_response(&self, request: &HttpRequest, response: &mut HttpResponse);

    fn max_response_size(&self) -> usize;
}

/// Response filters keyed by destination `host:port`.
pub trait ResponseFilters: Send + Sync {
    fn get_filter(&self, host_and_port: &str) -> Option<Arc<dyn ResponseFilter>>;
}

/// Map-backed [`ResponseFilters`]
#[derive(Default, Clone)]
pub struct ResponseFilterMap {
    filters: HashMap<String, Arc<dyn ResponseFilter>>,
}

impl ResponseFilterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, host_and_port: impl Into<String>, filter: Arc<dyn ResponseFilter>) -> Self {
        self.filters.insert(host_and_port.into().to_ascii_lowercase(), filter);
        self
    }
}

impl ResponseFilters for ResponseFilterMap {
    fn get_filter(&self, host_and_port: &str) -> Option<Arc<dyn ResponseFilter>> {
        self.filters.get(&host_and_port.to_ascii_lowercase()).cloned()
    }
}
