//! URI routing tree: handlers keyed by scheme, host and path segments, with
//! `{param}` wildcard segments bound at lookup time.

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use crate::change::ResourceChangePipeline;
use crate::context::ResourceHandler;
use crate::error::{Error, Result};

/// A node of the routing tree. The root's children are schemes, theirs are
/// hosts, and everything below is path segments.
#[derive(Default)]
pub(crate) struct RouteNode {
    children: HashMap<String, RouteNode>,
    wildcard: Option<Box<WildcardChild>>,
    handler: Option<Arc<dyn ResourceHandler>>,
    mime_type: Option<String>,
    change: Option<Arc<ResourceChangePipeline>>,
}

struct WildcardChild {
    name: String,
    node: RouteNode,
}

/// Result of a successful lookup.
pub(crate) struct RouteMatch {
    pub handler: Arc<dyn ResourceHandler>,
    pub params: HashMap<String, String>,
    pub mime_type: Option<String>,
    pub change: Arc<ResourceChangePipeline>,
}

#[derive(Default)]
pub(crate) struct RouteTree {
    root: RouteNode,
}

fn path_segments(uri: &Url) -> Vec<&str> {
    // "/" and the empty path address the same node.
    let trimmed = uri.path().trim_start_matches('/');
    if trimmed.is_empty() {
        Vec::new()
    } else {
        trimmed.split('/').collect()
    }
}

/// Parameter name of a `{name}` wildcard segment. The url crate
/// percent-encodes braces in paths, so both spellings are recognised.
pub(crate) fn wildcard_name(segment: &str) -> Option<&str> {
    if let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        return Some(inner);
    }
    segment
        .strip_prefix("%7B")
        .and_then(|s| s.strip_suffix("%7D"))
}

impl RouteTree {
    /// Create or update the node addressed by `uri`. A `None` handler
    /// creates the node without making it routable; a later insert with a
    /// real handler replaces it in place.
    pub(crate) fn insert(
        &mut self,
        uri: &Url,
        handler: Option<Arc<dyn ResourceHandler>>,
        mime_type: Option<String>,
    ) {
        let scheme_node = self
            .root
            .children
            .entry(uri.scheme().to_string())
            .or_default();
        let host_node = scheme_node
            .children
            .entry(uri.host_str().unwrap_or("").to_string())
            .or_default();

        let mut node = host_node;
        for segment in path_segments(uri) {
            if let Some(name) = wildcard_name(segment) {
                // One wildcard slot per node; the first registered name wins
                // so matching stays deterministic.
                node = &mut node
                    .wildcard
                    .get_or_insert_with(|| {
                        Box::new(WildcardChild {
                            name: name.to_string(),
                            node: RouteNode::default(),
                        })
                    })
                    .node;
            } else {
                node = node.children.entry(segment.to_string()).or_default();
            }
        }

        if handler.is_some() {
            node.handler = handler;
        }
        if mime_type.is_some() {
            node.mime_type = mime_type;
        }
        // Every addressable node carries a change pipeline so subscriptions
        // work whether or not an observer was attached.
        node.change
            .get_or_insert_with(|| Arc::new(ResourceChangePipeline::new()));
    }

    /// Find the handler for a concrete `uri`, binding wildcard segments to
    /// path parameters. Literal children win over a wildcard sibling.
    pub(crate) fn matching(&self, uri: &Url) -> Result<RouteMatch> {
        let scheme = uri.scheme();
        let node = self
            .root
            .children
            .get(scheme)
            .ok_or_else(|| Error::SchemeNotFound(scheme.to_string()))?;

        let host = uri.host_str().unwrap_or("");
        let mut node = node
            .children
            .get(host)
            .ok_or_else(|| Error::HostNotFound(host.to_string()))?;

        let mut params = HashMap::new();
        for segment in path_segments(uri) {
            if let Some(child) = node.children.get(segment) {
                node = child;
            } else if let Some(wild) = &node.wildcard {
                params.insert(wild.name.clone(), segment.to_string());
                node = &wild.node;
            } else {
                return Err(Error::PathNotFound(segment.to_string()));
            }
        }

        let handler = node
            .handler
            .clone()
            .ok_or_else(|| Error::NotRoutable(uri.to_string()))?;
        let change = node
            .change
            .clone()
            .unwrap_or_else(|| Arc::new(ResourceChangePipeline::new()));
        Ok(RouteMatch {
            handler,
            params,
            mime_type: node.mime_type.clone(),
            change,
        })
    }

    /// Change pipeline of the node addressed by `uri`, creating the node if
    /// it does not exist yet. Used by observer registration.
    pub(crate) fn change_pipeline(&mut self, uri: &Url) -> Arc<ResourceChangePipeline> {
        self.insert(uri, None, None);
        let mut node = self
            .root
            .children
            .get_mut(uri.scheme())
            .and_then(|n| n.children.get_mut(uri.host_str().unwrap_or("")))
            .expect("node inserted above");
        for segment in path_segments(uri) {
            node = if wildcard_name(segment).is_some() || !node.children.contains_key(segment) {
                &mut node.wildcard.as_mut().expect("node inserted above").node
            } else {
                node.children.get_mut(segment).expect("checked above")
            };
        }
        node.change
            .get_or_insert_with(|| Arc::new(ResourceChangePipeline::new()))
            .clone()
    }

    /// Wrap every registered handler, outermost middleware first.
    pub(crate) fn apply_middleware(
        &mut self,
        wrap: &dyn Fn(Arc<dyn ResourceHandler>) -> Arc<dyn ResourceHandler>,
    ) {
        fn walk(
            node: &mut RouteNode,
            wrap: &dyn Fn(Arc<dyn ResourceHandler>) -> Arc<dyn ResourceHandler>,
        ) {
            if let Some(handler) = node.handler.take() {
                node.handler = Some(wrap(handler));
            }
            for child in node.children.values_mut() {
                walk(child, wrap);
            }
            if let Some(wild) = node.wildcard.as_mut() {
                walk(&mut wild.node, wrap);
            }
        }
        walk(&mut self.root, wrap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ResourceContext;

    fn noop_handler() -> Arc<dyn ResourceHandler> {
        Arc::new(|_c: &mut ResourceContext| -> crate::error::Result<()> { Ok(()) })
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn registered_uri_matches_with_empty_params() {
        let mut tree = RouteTree::default();
        let handler = noop_handler();
        tree.insert(&url("example://e.com/users/all"), Some(handler.clone()), None);

        let m = tree.matching(&url("example://e.com/users/all")).unwrap();
        assert!(Arc::ptr_eq(&m.handler, &handler));
        assert!(m.params.is_empty());
    }

    #[test]
    fn wildcard_segment_binds_param() {
        let mut tree = RouteTree::default();
        tree.insert(&url("example://e.com/users/{id}"), Some(noop_handler()), None);

        let m = tree.matching(&url("example://e.com/users/42")).unwrap();
        assert_eq!(m.params.get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn literal_child_wins_over_wildcard_sibling() {
        let mut tree = RouteTree::default();
        let literal = noop_handler();
        let wild = noop_handler();
        tree.insert(&url("example://e.com/users/{id}"), Some(wild.clone()), None);
        tree.insert(&url("example://e.com/users/me"), Some(literal.clone()), None);

        let m = tree.matching(&url("example://e.com/users/me")).unwrap();
        assert!(Arc::ptr_eq(&m.handler, &literal));
        assert!(m.params.is_empty());

        let m = tree.matching(&url("example://e.com/users/42")).unwrap();
        assert!(Arc::ptr_eq(&m.handler, &wild));
    }

    #[test]
    fn template_uri_itself_routes_through_the_wildcard() {
        let mut tree = RouteTree::default();
        tree.insert(&url("example://e.com/users/{id}"), Some(noop_handler()), None);
        // Subscription requests address resources by their template URI.
        assert!(tree.matching(&url("example://e.com/users/{id}")).is_ok());
    }

    #[test]
    fn reinsert_replaces_handler_in_place() {
        let mut tree = RouteTree::default();
        let first = noop_handler();
        let second = noop_handler();
        tree.insert(&url("example://e.com/users"), Some(first), None);
        tree.insert(&url("example://e.com/users"), Some(second.clone()), None);

        let m = tree.matching(&url("example://e.com/users")).unwrap();
        assert!(Arc::ptr_eq(&m.handler, &second));
    }

    #[test]
    fn lookup_errors_name_the_failing_level() {
        let mut tree = RouteTree::default();
        tree.insert(&url("example://e.com/users"), Some(noop_handler()), None);

        assert!(matches!(
            tree.matching(&url("other://e.com/users")),
            Err(Error::SchemeNotFound(s)) if s == "other"
        ));
        assert!(matches!(
            tree.matching(&url("example://x.com/users")),
            Err(Error::HostNotFound(h)) if h == "x.com"
        ));
        assert!(matches!(
            tree.matching(&url("example://e.com/posts")),
            Err(Error::PathNotFound(p)) if p == "posts"
        ));
    }

    #[test]
    fn node_without_handler_is_not_routable() {
        let mut tree = RouteTree::default();
        tree.insert(&url("example://e.com/pending"), None, None);

        assert!(matches!(
            tree.matching(&url("example://e.com/pending")),
            Err(Error::NotRoutable(_))
        ));

        // Attaching a real handler later makes it routable.
        tree.insert(&url("example://e.com/pending"), Some(noop_handler()), None);
        assert!(tree.matching(&url("example://e.com/pending")).is_ok());
    }

    #[test]
    fn root_path_and_empty_path_are_equivalent() {
        let mut tree = RouteTree::default();
        tree.insert(&url("example://e.com/"), Some(noop_handler()), None);
        assert!(tree.matching(&url("example://e.com")).is_ok());
        assert!(tree.matching(&url("example://e.com/")).is_ok());
    }

    #[test]
    fn change_pipeline_is_shared_between_registration_and_lookup() {
        let mut tree = RouteTree::default();
        tree.insert(&url("example://e.com/users/{id}"), Some(noop_handler()), None);
        let pipeline = tree.change_pipeline(&url("example://e.com/users/{id}"));

        let m = tree.matching(&url("example://e.com/users/42")).unwrap();
        assert!(Arc::ptr_eq(&m.change, &pipeline));
    }
}
