//! Model-family routing table.

use crate::config::RouteConfig;
use crate::error::{Error, Result};

/// The upstream endpoint chosen for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRoute {
    /// Endpoint family tag (sent upstream as `endpoint`).
    pub family: String,
    pub url: String,
}

impl From<&RouteConfig> for SelectedRoute {
    fn from(config: &RouteConfig) -> Self {
        Self {
            family: config.family.clone(),
            url: config.url.clone(),
        }
    }
}

/// Router for selecting upstream routes.
#[derive(Debug, Clone)]
pub struct Router {
    routes: Vec<RouteConfig>,
}

impl Router {
    /// Create a new router over the given routes. Order is significant.
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        Self { routes }
    }

    /// Select the route for a model: the first entry whose prefix matches.
    pub fn select(&self, model: &str) -> Result<SelectedRoute> {
        let route = self
            .routes
            .iter()
            .find(|r| model.starts_with(r.prefix.as_str()))
            .ok_or_else(|| Error::UnsupportedModel {
                model: model.to_string(),
            })?;

        tracing::debug!(model = %model, prefix = %route.prefix, family = %route.family, "Matched route");
        Ok(SelectedRoute::from(route))
    }

    /// Get all configured routes.
    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }
}
