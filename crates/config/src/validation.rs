//! Validation of loaded API definitions.
//!
//! Definitions that fail validation are excluded from the snapshot; the
//! reload proceeds with the remaining set. Validation checks structural
//! requirements and compiles every regex a definition references so the
//! request path never sees a compile error.

use regex::Regex;
use tracing::warn;

use crate::apidef::{ApiDefinition, ListenProtocol};

/// Validate a single definition. Returns the reasons it was rejected, empty
/// when the definition is acceptable.
pub fn validate_definition(def: &ApiDefinition) -> Vec<String> {
    let mut errors = Vec::new();

    if def.api_id.is_empty() {
        errors.push("api_id must not be empty".to_string());
    }
    if !def.listen_path.starts_with('/') {
        errors.push(format!(
            "listen_path '{}' must start with '/'",
            def.listen_path
        ));
    }
    match def.protocol {
        ListenProtocol::Http | ListenProtocol::Https => {
            if def.target_urls.is_empty() {
                errors.push("at least one target URL is required".to_string());
            }
            for target in &def.target_urls {
                if target.parse::<http::Uri>().is_err() {
                    errors.push(format!("target URL '{}' does not parse", target));
                }
            }
        }
        ListenProtocol::Tcp | ListenProtocol::Tls => {
            if def.listen_port.is_none() {
                errors.push("tcp/tls APIs must declare a listen_port".to_string());
            }
            if def.target_urls.is_empty() {
                errors.push("tcp/tls APIs need a target address".to_string());
            }
        }
    }

    for rewrite in &def.url_rewrites {
        if let Err(e) = Regex::new(&rewrite.match_pattern) {
            errors.push(format!(
                "url rewrite pattern '{}' does not compile: {}",
                rewrite.match_pattern, e
            ));
        }
    }
    for breaker in &def.circuit_breakers {
        if !(0.0..=1.0).contains(&breaker.threshold) {
            errors.push(format!(
                "breaker threshold {} out of range 0.0..=1.0",
                breaker.threshold
            ));
        }
        if breaker.samples == 0 {
            errors.push("breaker samples must be at least 1".to_string());
        }
    }
    for timeout in &def.hard_timeouts {
        if timeout.timeout == 0 {
            errors.push(format!("hard timeout on '{}' must be non-zero", timeout.path));
        }
    }
    for (name, version) in &def.versions {
        for pm in version
            .paths
            .allow
            .iter()
            .chain(version.paths.ignore.iter())
            .chain(version.paths.block.iter())
        {
            if let Err(e) = Regex::new(&pm.pattern) {
                errors.push(format!(
                    "version '{}' path pattern '{}' does not compile: {}",
                    name, pm.pattern, e
                ));
            }
        }
    }
    for path in &def.cache_options.paths {
        if let Err(e) = Regex::new(path) {
            errors.push(format!("cache path '{}' does not compile: {}", path, e));
        }
    }

    errors
}

/// Filter a loaded set down to the valid definitions, logging exclusions.
pub fn filter_valid(defs: Vec<ApiDefinition>) -> Vec<ApiDefinition> {
    defs.into_iter()
        .filter(|def| {
            let errors = validate_definition(def);
            if errors.is_empty() {
                true
            } else {
                warn!(
                    api_id = %def.api_id,
                    name = %def.name,
                    reasons = ?errors,
                    "Skipping API definition that failed validation"
                );
                false
            }
        })
        .collect()
}
