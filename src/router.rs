//! Ordered path routing with named parameters and wildcard splats.
//!
//! Patterns use `:name` for a captured segment and `*` for a wildcard
//! (splat) segment. Route resolution is first-match-wins in registration
//! order; there is no regex involved, and none is needed since the codec
//! already bounds incoming paths to 1024 characters.

use std::collections::HashMap;

use crate::middleware::{EmptyHandlerChain, Handler};

/// A single registered route: its pattern and composed handler.
pub struct Route {
    pattern: String,
    segments: Vec<Segment>,
    handler: Handler,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
    Splat,
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    pattern
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if segment == "*" {
                Segment::Splat
            } else if let Some(name) = segment.strip_prefix(':') {
                Segment::Param(name.to_owned())
            } else {
                Segment::Literal(segment.to_owned())
            }
        })
        .collect()
}

/// The result of a successful [`Router::match_path`] call.
pub struct RouteMatch<'r> {
    /// The pattern string that matched.
    pub pattern: &'r str,
    /// Named parameter captures, keyed by parameter name.
    pub params: HashMap<String, String>,
    /// Ordered wildcard captures.
    pub splats: Vec<String>,
    /// The handler registered for this pattern.
    pub handler: &'r Handler,
}

/// An ordered collection of `(pattern, handler)` entries.
#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self { Self { routes: Vec::new() } }

    /// Register a pattern with its composed handler, appending to the
    /// ordered route list.
    ///
    /// # Errors
    ///
    /// Returns [`EmptyHandlerChain`] if `handlers` is empty; this mirrors
    /// `compose`'s own rejection of zero-handler chains (see
    /// [`crate::middleware::compose`]).
    pub fn register(
        &mut self,
        pattern: impl Into<String>,
        handlers: Vec<crate::middleware::BoxedHandlerFn>,
    ) -> Result<(), EmptyHandlerChain> {
        let handler = crate::middleware::compose(handlers)?;
        let pattern = pattern.into();
        let segments = parse_pattern(&pattern);
        self.routes.push(Route { pattern, segments, handler });
        Ok(())
    }

    /// Resolve a concrete path against the registered routes, returning the
    /// first match in registration order.
    #[must_use]
    pub fn match_path(&self, path: &str) -> Option<RouteMatch<'_>> {
        let candidate: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.routes.iter().find_map(|route| match_route(route, &candidate))
    }
}

fn match_route<'r>(route: &'r Route, candidate: &[&str]) -> Option<RouteMatch<'r>> {
    let mut params = HashMap::new();
    let mut splats = Vec::new();
    let mut idx = 0usize;

    for segment in &route.segments {
        match segment {
            Segment::Splat => {
                splats.extend(candidate.get(idx..)?.iter().map(|s| (*s).to_owned()));
                idx = candidate.len();
                break;
            }
            Segment::Param(name) => {
                let value = candidate.get(idx)?;
                params.insert(name.clone(), (*value).to_owned());
                idx += 1;
            }
            Segment::Literal(literal) => {
                let value = candidate.get(idx)?;
                if value != literal {
                    return None;
                }
                idx += 1;
            }
        }
    }

    if idx != candidate.len() {
        return None;
    }

    Some(RouteMatch { pattern: &route.pattern, params, splats, handler: &route.handler })
}
