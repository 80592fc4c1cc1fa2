// Routing table: rule matching and reverse URL building

use crate::Error;
use std::collections::HashMap;

/// Result of a successful route match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub endpoint: String,
    pub params: HashMap<String, String>,
}

/// The contract the dispatch pipeline consumes. A router maps a request's
/// path and method to an endpoint plus extracted variables, and can build
/// a URL back from an endpoint and a set of values.
pub trait Router: Send + Sync {
    /// Match a path and method against the routing table.
    ///
    /// Failures carry HTTP semantics: 404 when nothing matches, 405 when a
    /// rule matches the path but not the method, 308 when the request must
    /// be retried at the canonical trailing-slash location.
    fn match_route(&self, path: &str, method: &str) -> Result<RouteMatch, Error>;

    /// Build a URL for an endpoint. Values not consumed by the rule's
    /// variables are appended as a query string.
    fn build(&self, endpoint: &str, values: &HashMap<String, String>) -> Result<String, Error>;
}

/// Variable converters supported in rule patterns, `<name>`,
/// `<int:name>` and `<path:name>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Converter {
    Default,
    Int,
    Path,
}

#[derive(Debug, Clone)]
enum Segment {
    Static(String),
    Variable { name: String, converter: Converter },
}

/// A single URL rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: String,
    pub endpoint: String,
    pub methods: Vec<String>,
    segments: Vec<Segment>,
    strict_slash: bool,
}

impl Rule {
    fn new(pattern: &str, endpoint: &str, methods: &[&str]) -> Self {
        let segments = pattern
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|part| {
                if let Some(inner) = part.strip_prefix('<').and_then(|p| p.strip_suffix('>')) {
                    let (converter, name) = match inner.split_once(':') {
                        Some(("int", name)) => (Converter::Int, name),
                        Some(("path", name)) => (Converter::Path, name),
                        Some((_, name)) => (Converter::Default, name),
                        None => (Converter::Default, inner),
                    };
                    Segment::Variable {
                        name: name.to_string(),
                        converter,
                    }
                } else {
                    Segment::Static(part.to_string())
                }
            })
            .collect();

        Self {
            pattern: pattern.to_string(),
            endpoint: endpoint.to_string(),
            methods: methods.iter().map(|m| m.to_uppercase()).collect(),
            segments,
            strict_slash: pattern.len() > 1 && pattern.ends_with('/'),
        }
    }

    fn allows_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }

    /// Match the path against this rule's segments, extracting variables.
    fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        // Rules ending in a slash only accept paths ending in a slash,
        // and vice versa; the redirect case is decided by the caller.
        if self.strict_slash != (path.len() > 1 && path.ends_with('/')) {
            return None;
        }

        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = HashMap::new();
        let mut index = 0;

        for (pos, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Static(expected) => {
                    if parts.get(index) != Some(&expected.as_str()) {
                        return None;
                    }
                    index += 1;
                }
                Segment::Variable { name, converter } => match converter {
                    Converter::Default => {
                        let value = parts.get(index)?;
                        params.insert(name.clone(), (*value).to_string());
                        index += 1;
                    }
                    Converter::Int => {
                        let value = parts.get(index)?;
                        value.parse::<i64>().ok()?;
                        params.insert(name.clone(), (*value).to_string());
                        index += 1;
                    }
                    Converter::Path => {
                        // Greedy: consumes the rest of the path. Only valid
                        // as the final segment of a rule.
                        if pos != self.segments.len() - 1 || index >= parts.len() {
                            return None;
                        }
                        params.insert(name.clone(), parts[index..].join("/"));
                        index = parts.len();
                    }
                },
            }
        }

        if index == parts.len() {
            Some(params)
        } else {
            None
        }
    }

    /// Substitute values into the pattern, returning the path and the
    /// names that were consumed.
    fn build_path(&self, values: &HashMap<String, String>) -> Result<(String, Vec<String>), Error> {
        let mut used = Vec::new();
        let mut parts = Vec::new();

        for segment in &self.segments {
            match segment {
                Segment::Static(s) => parts.push(s.clone()),
                Segment::Variable { name, .. } => {
                    let value = values.get(name).ok_or_else(|| {
                        Error::UrlBuild(format!(
                            "missing value for variable '{}' of endpoint '{}'",
                            name, self.endpoint
                        ))
                    })?;
                    used.push(name.clone());
                    parts.push(value.clone());
                }
            }
        }

        let mut path = format!("/{}", parts.join("/"));
        if self.strict_slash {
            path.push('/');
        }
        Ok((path, used))
    }
}

/// Ordered routing table. First matching rule wins, mirroring
/// registration order.
#[derive(Default)]
pub struct RouteTable {
    rules: Vec<Rule>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a URL rule to the table
    pub fn add(&mut self, pattern: &str, endpoint: &str, methods: &[&str]) {
        self.rules.push(Rule::new(pattern, endpoint, methods));
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Router for RouteTable {
    fn match_route(&self, path: &str, method: &str) -> Result<RouteMatch, Error> {
        let mut allowed: Vec<String> = Vec::new();

        for rule in &self.rules {
            if let Some(params) = rule.match_path(path) {
                if rule.allows_method(method) {
                    return Ok(RouteMatch {
                        endpoint: rule.endpoint.clone(),
                        params,
                    });
                }
                allowed.extend(rule.methods.iter().cloned());
            }
        }

        if !allowed.is_empty() {
            return Err(Error::MethodNotAllowed(format!(
                "{} {} (allowed: {})",
                method,
                path,
                allowed.join(", ")
            )));
        }

        // Trailing-slash rule: a request without the slash for a rule that
        // requires one is redirected to the canonical location.
        if !path.ends_with('/') {
            let canonical = format!("{}/", path);
            if self.rules.iter().any(|r| r.match_path(&canonical).is_some()) {
                return Err(Error::RedirectRequired { location: canonical });
            }
        }

        Err(Error::NotFound(format!("{} {}", method, path)))
    }

    fn build(&self, endpoint: &str, values: &HashMap<String, String>) -> Result<String, Error> {
        let rule = self
            .rules
            .iter()
            .find(|r| r.endpoint == endpoint)
            .ok_or_else(|| Error::UrlBuild(format!("unknown endpoint '{}'", endpoint)))?;

        let (mut path, used) = rule.build_path(values)?;

        let leftover: Vec<(&String, &String)> = values
            .iter()
            .filter(|(name, _)| !used.contains(name))
            .collect();
        if !leftover.is_empty() {
            let mut pairs: Vec<(String, String)> = leftover
                .into_iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            pairs.sort();
            let query = serde_urlencoded::to_string(&pairs)
                .map_err(|e| Error::UrlBuild(e.to_string()))?;
            path.push('?');
            path.push_str(&query);
        }

        Ok(path)
    }
}
