//! API and policy registries.
//!
//! Both registries hold an immutable snapshot behind an atomic pointer.
//! Readers take zero locks; the reload coordinator is the only writer and
//! replaces whole snapshots. An [`ApiSpec`] is a validated definition with
//! every regex compiled and the per-path circuit breakers created, so
//! breaker state lives and dies with the snapshot.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use gantry_common::{ApiId, BreakerConfig, CircuitBreaker, GatewayError, GatewayResult};
use gantry_config::{ApiDefinition, PathMatch, Policy, VersionInfo};

/// Path classification against a version's allow/ignore/block lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    /// Listed as allowed, or no allow-list exists
    Allowed,
    /// Listed as ignored: skip auth and limits
    Ignored,
    /// Listed as blocked: refuse outright
    Blocked,
    /// An allow-list exists and the path is not on it
    NotListed,
}

struct CompiledPathMatch {
    regex: Regex,
    methods: Vec<String>,
}

impl CompiledPathMatch {
    fn compile(pm: &PathMatch) -> GatewayResult<Self> {
        let regex = Regex::new(&pm.pattern).map_err(|e| {
            GatewayError::config(format!("path pattern '{}': {}", pm.pattern, e))
        })?;
        Ok(Self {
            regex,
            methods: pm.methods.iter().map(|m| m.to_uppercase()).collect(),
        })
    }

    fn matches(&self, path: &str, method: &str) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m == method) {
            return false;
        }
        self.regex.is_match(path)
    }
}

/// A version with its path lists compiled.
pub struct CompiledVersion {
    pub name: String,
    pub expires: Option<DateTime<Utc>>,
    allow: Vec<CompiledPathMatch>,
    ignore: Vec<CompiledPathMatch>,
    block: Vec<CompiledPathMatch>,
}

impl CompiledVersion {
    fn compile(name: &str, info: &VersionInfo) -> GatewayResult<Self> {
        let compile_all = |list: &[PathMatch]| -> GatewayResult<Vec<CompiledPathMatch>> {
            list.iter().map(CompiledPathMatch::compile).collect()
        };
        let expires = match &info.expires {
            Some(raw) if !raw.is_empty() => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| {
                        GatewayError::config(format!("version '{}' expiry: {}", name, e))
                    })?
                    .with_timezone(&Utc),
            ),
            _ => None,
        };
        Ok(Self {
            name: name.to_string(),
            expires,
            allow: compile_all(&info.paths.allow)?,
            ignore: compile_all(&info.paths.ignore)?,
            block: compile_all(&info.paths.block)?,
        })
    }

    /// Classify a (stripped) path for this version. Block wins over ignore;
    /// an allow-list, when present, excludes everything not on it.
    pub fn classify(&self, path: &str, method: &str) -> PathStatus {
        if self.block.iter().any(|m| m.matches(path, method)) {
            return PathStatus::Blocked;
        }
        if self.ignore.iter().any(|m| m.matches(path, method)) {
            return PathStatus::Ignored;
        }
        if self.allow.is_empty() {
            return PathStatus::Allowed;
        }
        if self.allow.iter().any(|m| m.matches(path, method)) {
            PathStatus::Allowed
        } else {
            PathStatus::NotListed
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|t| t < now).unwrap_or(false)
    }
}

struct CompiledRewrite {
    regex: Regex,
    method: Option<String>,
    template: String,
}

struct CompiledTimeout {
    regex: Regex,
    method: Option<String>,
    timeout: Duration,
}

struct CompiledBreaker {
    regex: Regex,
    method: Option<String>,
    breaker: Arc<CircuitBreaker>,
}

/// A body transform with its path pattern compiled.
pub struct CompiledBodyTransform {
    regex: Regex,
    method: Option<String>,
    pub add: std::collections::HashMap<String, serde_json::Value>,
    pub remove: Vec<String>,
}

impl CompiledBodyTransform {
    fn compile(raw: &gantry_config::BodyTransform) -> GatewayResult<Self> {
        Ok(Self {
            regex: Regex::new(&raw.path).map_err(|e| {
                GatewayError::config(format!("body transform '{}': {}", raw.path, e))
            })?,
            method: raw.method.clone(),
            add: raw.add.clone(),
            remove: raw.remove.clone(),
        })
    }
}

fn method_matches(filter: &Option<String>, method: &str) -> bool {
    filter
        .as_deref()
        .map(|m| m.eq_ignore_ascii_case(method))
        .unwrap_or(true)
}

/// A validated, compiled API ready for the request path.
pub struct ApiSpec {
    id: ApiId,
    pub def: ApiDefinition,
    versions: HashMap<String, CompiledVersion>,
    rewrites: Vec<CompiledRewrite>,
    timeouts: Vec<CompiledTimeout>,
    breakers: Vec<CompiledBreaker>,
    cache_paths: Vec<Regex>,
    body_transforms: Vec<Arc<CompiledBodyTransform>>,
    response_body_transforms: Vec<Arc<CompiledBodyTransform>>,
    selector: crate::upstream::TargetSelector,
}

impl ApiSpec {
    /// Compile a definition. Callers are expected to have run validation;
    /// compile errors here still reject the definition rather than panic.
    pub fn build(def: ApiDefinition) -> GatewayResult<Self> {
        let mut versions = HashMap::new();
        for (name, info) in &def.versions {
            versions.insert(name.clone(), CompiledVersion::compile(name, info)?);
        }

        let rewrites = def
            .url_rewrites
            .iter()
            .map(|r| {
                Ok(CompiledRewrite {
                    regex: Regex::new(&r.match_pattern).map_err(|e| {
                        GatewayError::config(format!(
                            "rewrite '{}': {}",
                            r.match_pattern, e
                        ))
                    })?,
                    method: r.method.clone(),
                    template: r.rewrite_to.clone(),
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let timeouts = def
            .hard_timeouts
            .iter()
            .map(|t| {
                Ok(CompiledTimeout {
                    regex: Regex::new(&t.path).map_err(|e| {
                        GatewayError::config(format!("hard timeout '{}': {}", t.path, e))
                    })?,
                    method: t.method.clone(),
                    timeout: Duration::from_secs(t.timeout),
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let breakers = def
            .circuit_breakers
            .iter()
            .map(|b| {
                let regex = Regex::new(&b.path).map_err(|e| {
                    GatewayError::config(format!("breaker '{}': {}", b.path, e))
                })?;
                let name = format!(
                    "{}:{}:{}",
                    def.api_id,
                    b.path,
                    b.method.as_deref().unwrap_or("*")
                );
                Ok(CompiledBreaker {
                    regex,
                    method: b.method.clone(),
                    breaker: Arc::new(CircuitBreaker::new(
                        BreakerConfig {
                            threshold: b.threshold,
                            samples: b.samples,
                            return_to_service_after: Duration::from_secs(
                                b.return_to_service_after,
                            ),
                        },
                        name,
                    )),
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let cache_paths = def
            .cache_options
            .paths
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    GatewayError::config(format!("cache path '{}': {}", p, e))
                })
            })
            .collect::<GatewayResult<Vec<_>>>()?;

        let body_transforms = def
            .body_transforms
            .iter()
            .map(|t| CompiledBodyTransform::compile(t).map(Arc::new))
            .collect::<GatewayResult<Vec<_>>>()?;
        let response_body_transforms = def
            .response_body_transforms
            .iter()
            .map(|t| CompiledBodyTransform::compile(t).map(Arc::new))
            .collect::<GatewayResult<Vec<_>>>()?;

        let selector = crate::upstream::TargetSelector::new(&def.target_urls)?;

        Ok(Self {
            id: ApiId::new(def.api_id.clone()),
            def,
            versions,
            rewrites,
            timeouts,
            breakers,
            cache_paths,
            body_transforms,
            response_body_transforms,
            selector,
        })
    }

    /// Pick the next upstream target, round-robin.
    pub fn select_target(&self) -> &crate::upstream::Target {
        self.selector.next()
    }

    pub fn id(&self) -> &ApiId {
        &self.id
    }

    pub fn api_id(&self) -> &str {
        self.id.as_str()
    }

    /// Strip the listen path from a request path when configured.
    pub fn strip_path<'a>(&self, path: &'a str) -> &'a str {
        if !self.def.strip_listen_path {
            return path;
        }
        let listen = self.def.listen_path.trim_end_matches('/');
        match path.strip_prefix(listen) {
            Some(rest) if rest.is_empty() => "/",
            Some(rest) => rest,
            None => path,
        }
    }

    pub fn version(&self, name: &str) -> Option<&CompiledVersion> {
        self.versions.get(name)
    }

    pub fn has_versions(&self) -> bool {
        !self.versions.is_empty()
    }

    /// Apply the first matching URL rewrite to a stripped path.
    pub fn rewrite_path(&self, path: &str, method: &str) -> Option<String> {
        for rewrite in &self.rewrites {
            if method_matches(&rewrite.method, method) && rewrite.regex.is_match(path) {
                return Some(
                    rewrite
                        .regex
                        .replace(path, rewrite.template.as_str())
                        .into_owned(),
                );
            }
        }
        None
    }

    /// Per-path enforced timeout, if one matches.
    pub fn hard_timeout_for(&self, path: &str, method: &str) -> Option<Duration> {
        self.timeouts
            .iter()
            .find(|t| method_matches(&t.method, method) && t.regex.is_match(path))
            .map(|t| t.timeout)
    }

    /// Request body transform matching a path, if any.
    pub fn body_transform_for(
        &self,
        path: &str,
        method: &str,
    ) -> Option<Arc<CompiledBodyTransform>> {
        self.body_transforms
            .iter()
            .find(|t| method_matches(&t.method, method) && t.regex.is_match(path))
            .map(Arc::clone)
    }

    /// Response body transform matching a path, if any.
    pub fn response_body_transform_for(
        &self,
        path: &str,
        method: &str,
    ) -> Option<Arc<CompiledBodyTransform>> {
        self.response_body_transforms
            .iter()
            .find(|t| method_matches(&t.method, method) && t.regex.is_match(path))
            .map(Arc::clone)
    }

    /// Circuit breaker guarding a path, if one is configured.
    pub fn breaker_for(&self, path: &str, method: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .iter()
            .find(|b| method_matches(&b.method, method) && b.regex.is_match(path))
            .map(|b| Arc::clone(&b.breaker))
    }

    /// Whether a request is cacheable for this API before looking at the
    /// response (method + path gate).
    pub fn is_cacheable_request(&self, path: &str, method: &str) -> bool {
        let options = &self.def.cache_options;
        if !options.enabled {
            return false;
        }
        let method_ok = options
            .methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method));
        if !method_ok {
            return false;
        }
        if options.cache_all_safe_requests {
            return true;
        }
        self.cache_paths.iter().any(|p| p.is_match(path))
    }
}

/// Atomic snapshot of the loaded API set.
pub struct ApiSnapshot {
    pub specs: Vec<Arc<ApiSpec>>,
    pub by_id: HashMap<ApiId, Arc<ApiSpec>>,
}

impl ApiSnapshot {
    pub fn empty() -> Self {
        Self {
            specs: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    /// Build a snapshot from compiled specs. Duplicate ids resolve
    /// last-wins with a warning.
    pub fn from_specs(specs: Vec<Arc<ApiSpec>>) -> Self {
        let mut by_id: HashMap<ApiId, Arc<ApiSpec>> = HashMap::new();
        let mut deduped = Vec::with_capacity(specs.len());
        for spec in specs {
            if let Some(previous) = by_id.insert(spec.id().clone(), Arc::clone(&spec))
            {
                warn!(
                    api_id = %previous.api_id(),
                    "Duplicate API id in loaded set, last definition wins"
                );
                deduped.retain(|s: &Arc<ApiSpec>| s.api_id() != spec.api_id());
            }
            deduped.push(spec);
        }
        Self {
            specs: deduped,
            by_id,
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// Lock-free API registry.
pub struct ApiRegistry {
    current: ArcSwap<ApiSnapshot>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ApiSnapshot::empty()),
        }
    }

    /// Lock-free read of the current snapshot.
    pub fn get(&self) -> Arc<ApiSnapshot> {
        self.current.load_full()
    }

    /// Install a new snapshot. Single-writer: only the reload coordinator
    /// calls this.
    pub fn replace(&self, snapshot: ApiSnapshot) {
        self.current.store(Arc::new(snapshot));
    }
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Lock-free policy registry.
pub struct PolicyRegistry {
    current: ArcSwap<HashMap<String, Policy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn get(&self) -> Arc<HashMap<String, Policy>> {
        self.current.load_full()
    }

    pub fn replace(&self, policies: HashMap<String, Policy>) {
        self.current.store(Arc::new(policies));
    }
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
