// ============================================================================
// FORWARD RULES
// ============================================================================
// A rule pairs a source pattern with target path templates. When a context
// path matches the source, each template is filled in from the match's
// variables, then from the rule's external resolvers in order, giving the
// contexts the source context should forward its observations to.
// ============================================================================

use std::fmt::Debug;
use std::sync::Arc;

use ahash::AHashMap;
use compact_str::CompactString;
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::matcher::{Bindings, PathMatcher};
use crate::path::{ContextPath, PATH_DELIMITER};

/// Variable name resolved by [`NodeNameResolver`].
pub const NODE_VARIABLE: &str = "node";

const VARIABLE_PREFIX: char = '$';

// ----------------------------------------------------------------------------
// 1 Variable Resolvers
// ----------------------------------------------------------------------------

/// Supplies values for template variables the source match did not bind.
pub trait VariableResolver: Send + Sync + Debug {
    fn resolve(&self, name: &str) -> Option<CompactString>;
}

/// Fixed name/value table.
#[derive(Debug, Clone, Default)]
pub struct MapResolver(AHashMap<CompactString, CompactString>);

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<CompactString>, value: impl Into<CompactString>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }
}

impl VariableResolver for MapResolver {
    fn resolve(&self, name: &str) -> Option<CompactString> {
        self.0.get(name).cloned()
    }
}

/// Resolves `$node` to the name of this process in a cluster.
#[derive(Debug, Clone)]
pub struct NodeNameResolver {
    node_name: CompactString,
}

impl NodeNameResolver {
    pub fn new(node_name: impl Into<CompactString>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }
}

impl VariableResolver for NodeNameResolver {
    fn resolve(&self, name: &str) -> Option<CompactString> {
        (name == NODE_VARIABLE).then(|| self.node_name.clone())
    }
}

// ----------------------------------------------------------------------------
// 2 Target Templates
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSegment {
    Literal(CompactString),
    Variable(CompactString),
}

impl TemplateSegment {
    fn parse(raw: &str) -> ConfigResult<Self> {
        match raw.strip_prefix(VARIABLE_PREFIX) {
            Some("") => Err(ConfigError::invalid_value(
                "forward_rules.target_templates",
                format!("template segment '{}' names no variable", raw),
            )),
            Some(name) => Ok(TemplateSegment::Variable(CompactString::from(name))),
            None => Ok(TemplateSegment::Literal(CompactString::from(raw))),
        }
    }
}

/// A target path with `$variable` placeholders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTemplate(Vec<TemplateSegment>);

impl TargetTemplate {
    pub fn new<I, S>(segments: I) -> ConfigResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        segments
            .into_iter()
            .filter(|s| !s.as_ref().is_empty())
            .map(|s| TemplateSegment::parse(s.as_ref()))
            .collect::<ConfigResult<Vec<_>>>()
            .map(Self)
    }

    /// Parse a `/`-delimited template such as `"$node/db/connection"`.
    pub fn parse(template: &str) -> ConfigResult<Self> {
        Self::new(template.split(PATH_DELIMITER))
    }

    pub fn segments(&self) -> &[TemplateSegment] {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// 3 Forward Rule
// ----------------------------------------------------------------------------

/// Routes matching source paths to target paths.
#[derive(Debug, Clone)]
pub struct ForwardRule {
    source: PathMatcher,
    templates: Vec<TargetTemplate>,
    resolvers: Vec<Arc<dyn VariableResolver>>,
}

impl ForwardRule {
    pub fn new(source: PathMatcher, templates: Vec<TargetTemplate>) -> Self {
        Self {
            source,
            templates,
            resolvers: Vec::new(),
        }
    }

    /// Compile from the string forms used in configuration.
    pub fn parse<S: AsRef<str>>(source_pattern: &str, templates: &[S]) -> ConfigResult<Self> {
        let source = PathMatcher::parse(source_pattern)?;
        let templates = templates
            .iter()
            .map(|t| TargetTemplate::parse(t.as_ref()))
            .collect::<ConfigResult<Vec<_>>>()?;
        Ok(Self::new(source, templates))
    }

    /// Append a resolver; resolvers are consulted in insertion order.
    pub fn with_resolver(mut self, resolver: Arc<dyn VariableResolver>) -> Self {
        self.resolvers.push(resolver);
        self
    }

    pub fn source(&self) -> &PathMatcher {
        &self.source
    }

    /// Target paths for `path`, in template order. Empty when the source
    /// pattern does not match. A template with an unresolvable variable is
    /// skipped.
    pub fn targets(&self, path: &ContextPath) -> Vec<ContextPath> {
        let Some(bindings) = self.source.matches(path) else {
            return Vec::new();
        };
        let targets: Vec<ContextPath> = self
            .templates
            .iter()
            .filter_map(|template| self.fill(template, &bindings, path))
            .collect();
        debug!(
            target: "vitals::forward",
            rule = %self.source,
            source = %path,
            targets = targets.len(),
            "Forward rule matched"
        );
        targets
    }

    fn fill(&self, template: &TargetTemplate, bindings: &Bindings, source: &ContextPath) -> Option<ContextPath> {
        let mut segments: Vec<CompactString> = Vec::with_capacity(template.0.len());
        for segment in &template.0 {
            match segment {
                TemplateSegment::Literal(literal) => segments.push(literal.clone()),
                TemplateSegment::Variable(name) => {
                    let value = bindings
                        .get(name)
                        .cloned()
                        .or_else(|| self.resolvers.iter().find_map(|r| r.resolve(name)));
                    match value {
                        Some(value) => segments.push(value),
                        None => {
                            warn!(
                                target: "vitals::forward",
                                rule = %self.source,
                                source = %source,
                                variable = %name,
                                "Unresolved forward variable, target skipped"
                            );
                            return None;
                        }
                    }
                }
            }
        }
        Some(ContextPath::new(segments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_resolver_fills_node_variable() {
        let rule = ForwardRule::new(
            PathMatcher::new(["**", "connection", "*", "statement", "*"]).unwrap(),
            vec![TargetTemplate::new(["$node", "db", "connection"]).unwrap()],
        )
        .with_resolver(Arc::new(MapResolver::new().with("node", "clusterNode1")));

        let targets = rule.targets(&ContextPath::from([
            "undefined",
            "connection",
            "1234",
            "statement",
            "18978394",
        ]));
        assert_eq!(targets, vec![ContextPath::from(["clusterNode1", "db", "connection"])]);
    }

    #[test]
    fn test_match_bindings_take_precedence() {
        let rule = ForwardRule::parse("*:node/db/<\\d+>:id", &["$node/ids/$id", "all/$node"])
            .unwrap()
            .with_resolver(Arc::new(NodeNameResolver::new("ignored")));
        let targets = rule.targets(&ContextPath::parse("n1/db/42"));
        assert_eq!(
            targets,
            vec![ContextPath::parse("n1/ids/42"), ContextPath::parse("all/n1")]
        );
    }

    #[test]
    fn test_resolvers_consulted_in_order() {
        let rule = ForwardRule::parse("a/**", &["$node/$region"])
            .unwrap()
            .with_resolver(Arc::new(NodeNameResolver::new("first")))
            .with_resolver(Arc::new(MapResolver::new().with("node", "second").with("region", "eu")));
        assert_eq!(rule.targets(&ContextPath::parse("a/b")), vec![ContextPath::parse("first/eu")]);
    }

    #[test]
    fn test_unresolved_variable_drops_template() {
        let rule = ForwardRule::parse("a", &["$missing/x", "fixed"]).unwrap();
        assert_eq!(rule.targets(&ContextPath::parse("a")), vec![ContextPath::parse("fixed")]);
        assert!(rule.targets(&ContextPath::parse("b")).is_empty());
    }

    #[test]
    fn test_empty_variable_name_rejected() {
        assert!(TargetTemplate::parse("$/x").is_err());
    }
}
