//! OpenAPI-ish route spec parsing and matching.
//!
//! The router uses a lightweight subset of OpenAPI (`paths` + HTTP methods) and relies on the
//! `x-scatter` vendor extension to name the sharded service each operation fans out to.

use std::collections::{BTreeMap, HashMap};

use http::Method;
use matchit::Router;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
/// `x-scatter` vendor extension (per operation).
pub struct ScatterOperationConfig {
    /// Logical service whose shards receive the request.
    pub service: String,

    #[serde(default)]
    /// Optional episode deadline override (milliseconds).
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
/// One operation entry under a path item.
pub struct Operation {
    #[serde(rename = "operationId", default)]
    pub operation_id: Option<String>,

    #[serde(rename = "x-scatter")]
    pub scatter: ScatterOperationConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
/// OpenAPI-ish "path item" containing method operations.
pub struct PathItem {
    #[serde(default)]
    pub get: Option<Operation>,
    #[serde(default)]
    pub post: Option<Operation>,
    #[serde(default)]
    pub put: Option<Operation>,
    #[serde(default)]
    pub delete: Option<Operation>,
    #[serde(default)]
    pub patch: Option<Operation>,
    #[serde(default)]
    pub head: Option<Operation>,
    #[serde(default)]
    pub options: Option<Operation>,
}

#[derive(Debug, Clone, Deserialize)]
/// Minimal OpenAPI-ish spec containing only `paths`.
pub struct OpenApiLikeSpec {
    pub paths: BTreeMap<String, PathItem>,
}

#[derive(Debug, Clone)]
/// Fully resolved per-operation configuration used by the router at runtime.
pub struct OperationConfig {
    pub route_template: String,
    pub method: Method,
    pub operation_id: Option<String>,
    pub service: String,
    pub deadline_ms: u64,
}

#[derive(Debug, Clone)]
struct RouteConfig {
    ops_by_method: HashMap<Method, OperationConfig>,
}

#[derive(Debug, Clone)]
/// A compiled route matcher.
pub struct CompiledSpec {
    router: Router<RouteConfig>,
    services: Vec<String>,
}

#[derive(Debug, Clone)]
/// Outcome of matching an incoming request to a configured operation.
pub enum RouteMatch<'a> {
    /// No configured path matched.
    NotFound,
    /// Path matched but method wasn't configured.
    MethodNotAllowed { allowed: Vec<Method> },
    /// Path+method matched and produced an operation config.
    Matched(&'a OperationConfig),
}

impl CompiledSpec {
    /// Parse and compile a YAML spec into a matcher.
    pub fn from_yaml_bytes(bytes: &[u8], default_deadline_ms: u64) -> anyhow::Result<Self> {
        let spec: OpenApiLikeSpec = serde_yaml::from_slice(bytes)?;
        Self::compile(spec, default_deadline_ms)
    }

    /// Match an `(HTTP method, path)` pair.
    pub fn match_request<'a>(&'a self, method: &Method, path: &str) -> RouteMatch<'a> {
        let Ok(matched) = self.router.at(path) else {
            return RouteMatch::NotFound;
        };

        match matched.value.ops_by_method.get(method) {
            Some(op) => RouteMatch::Matched(op),
            None => RouteMatch::MethodNotAllowed {
                allowed: {
                    let mut methods: Vec<Method> =
                        matched.value.ops_by_method.keys().cloned().collect();
                    methods.sort_by(|a, b| a.as_str().cmp(b.as_str()));
                    methods
                },
            },
        }
    }

    /// Every service referenced by at least one operation, sorted and deduplicated.
    pub fn services(&self) -> &[String] {
        &self.services
    }

    fn compile(spec: OpenApiLikeSpec, default_deadline_ms: u64) -> anyhow::Result<Self> {
        let mut router = Router::new();
        let mut services = Vec::new();
        for (route_template, item) in spec.paths {
            let matchit_path = openapi_path_to_matchit(&route_template)?;
            let mut ops_by_method = HashMap::new();
            for (method, op) in [
                (Method::GET, item.get),
                (Method::POST, item.post),
                (Method::PUT, item.put),
                (Method::DELETE, item.delete),
                (Method::PATCH, item.patch),
                (Method::HEAD, item.head),
                (Method::OPTIONS, item.options),
            ] {
                add_op(
                    &mut ops_by_method,
                    &route_template,
                    method,
                    op,
                    default_deadline_ms,
                )?;
            }

            if ops_by_method.is_empty() {
                continue;
            }

            services.extend(ops_by_method.values().map(|op| op.service.clone()));
            router.insert(matchit_path, RouteConfig { ops_by_method })?;
        }
        services.sort();
        services.dedup();
        Ok(Self { router, services })
    }
}

fn add_op(
    map: &mut HashMap<Method, OperationConfig>,
    route_template: &str,
    method: Method,
    op: Option<Operation>,
    default_deadline_ms: u64,
) -> anyhow::Result<()> {
    let Some(op) = op else {
        return Ok(());
    };

    if op.scatter.service.trim().is_empty() {
        anyhow::bail!("x-scatter.service must not be empty for {method} {route_template}");
    }
    let deadline_ms = op.scatter.timeout_ms.unwrap_or(default_deadline_ms);
    if deadline_ms == 0 {
        anyhow::bail!("x-scatter.timeoutMs must be > 0 for {method} {route_template}");
    }

    map.insert(
        method.clone(),
        OperationConfig {
            route_template: route_template.to_string(),
            method,
            operation_id: op.operation_id,
            service: op.scatter.service,
            deadline_ms,
        },
    );
    Ok(())
}

fn openapi_path_to_matchit(path: &str) -> anyhow::Result<String> {
    if !path.starts_with('/') {
        anyhow::bail!("path templates must start with '/': {path}");
    }

    let mut in_param = false;
    let mut param_name = String::new();
    for ch in path.chars() {
        match ch {
            '{' => {
                if in_param {
                    anyhow::bail!("nested '{{' in path template: {path}");
                }
                in_param = true;
                param_name.clear();
            }
            '}' => {
                if !in_param {
                    anyhow::bail!("unmatched '}}' in path template: {path}");
                }
                if param_name.is_empty() {
                    anyhow::bail!("empty '{{}}' param in path template: {path}");
                }
                in_param = false;
            }
            _ => {
                if in_param {
                    param_name.push(ch);
                }
            }
        }
    }

    if in_param {
        anyhow::bail!("unclosed '{{' in path template: {path}");
    }

    // OpenAPI-style templates already match `matchit`'s `{param}` syntax.
    Ok(path.to_string())
}
