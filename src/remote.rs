//! Remote host boundary: create a resource from a push-mode migration,
//! observe the resulting operation, and delete the resource on rollback.
//!
//! The pipeline only sees the [`RemoteApi`] and [`Operation`] traits.
//! [`HttpRemote`] implements them against the host's REST API; it never
//! speaks the data-plane protocol, it only hands the data endpoint to the
//! transfer tool.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use crate::error::{MigrateError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub mode: String,
}

impl MigrationSource {
    pub fn push() -> Self {
        Self {
            source_type: "migration".to_string(),
            mode: "push".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub architecture: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
    pub source: MigrationSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub volume_type: String,
    pub content_type: String,
    pub source: MigrationSource,
}

/// Remote creation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateSpec {
    Instance { project: String, spec: InstanceSpec },
    Volume { project: String, pool: String, spec: VolumeSpec },
}

impl CreateSpec {
    pub fn name(&self) -> &str {
        match self {
            CreateSpec::Instance { spec, .. } => &spec.name,
            CreateSpec::Volume { spec, .. } => &spec.name,
        }
    }

    /// Identity of the resource this spec creates, used for rollback.
    pub fn resource_id(&self) -> ResourceId {
        match self {
            CreateSpec::Instance { project, spec } => ResourceId::Instance {
                project: project.clone(),
                name: spec.name.clone(),
            },
            CreateSpec::Volume { project, pool, spec } => ResourceId::Volume {
                project: project.clone(),
                pool: pool.clone(),
                name: spec.name.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceId {
    Instance { project: String, name: String },
    Volume { project: String, pool: String, name: String },
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceId::Instance { project, name } => write!(f, "instance {project}/{name}"),
            ResourceId::Volume { project, pool, name } => {
                write!(f, "custom volume {project}/{pool}/{name}")
            }
        }
    }
}

/// State of a remote operation as observed by one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Running { progress: Option<String> },
    Succeeded,
    Failed(String),
}

/// Handle to a remote long-running migration operation.
pub trait Operation {
    fn id(&self) -> &str;

    /// Where the transfer tool sends the data.
    fn data_endpoint(&self) -> &str;

    fn poll(&mut self) -> Result<OperationStatus>;
}

/// The create / delete capabilities of the remote host.
pub trait RemoteApi: Send + Sync {
    fn create(&self, spec: &CreateSpec) -> Result<(ResourceId, Box<dyn Operation>)>;

    /// Delete a resource and wait for the deletion to finish.
    fn delete(&self, id: &ResourceId) -> Result<()>;
}

/// Checks (in order): `https_proxy`, `HTTPS_PROXY`, `http_proxy`, `HTTP_PROXY`,
/// `all_proxy`, `ALL_PROXY`. Returns the first non-empty value found.
fn proxy_from_env() -> Option<String> {
    for var in [
        "https_proxy",
        "HTTPS_PROXY",
        "http_proxy",
        "HTTP_PROXY",
        "all_proxy",
        "ALL_PROXY",
    ] {
        if let Ok(val) = std::env::var(var) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Build a ureq agent that reports HTTP errors as responses so the host's
/// error body can be surfaced.
fn build_http_agent() -> anyhow::Result<ureq::Agent> {
    let mut config = ureq::Agent::config_builder().http_status_as_error(false);
    if let Some(proxy_uri) = proxy_from_env() {
        tracing::debug!("using proxy: {proxy_uri}");
        let proxy = ureq::Proxy::new(&proxy_uri)
            .map_err(|e| anyhow::anyhow!("invalid proxy URI {proxy_uri}: {e}"))?;
        config = config.proxy(Some(proxy));
    }
    Ok(config.build().into())
}

fn remote_err(context: &str, err: impl fmt::Display) -> MigrateError {
    MigrateError::RemoteOperation(format!("{context}: {err}"))
}

/// Read a JSON response, turning non-2xx statuses into errors that carry
/// the host's own error message.
fn read_response(
    context: &str,
    response: std::result::Result<ureq::http::Response<ureq::Body>, ureq::Error>,
) -> Result<Value> {
    let mut response = response.map_err(|e| remote_err(context, e))?;
    let status = response.status();
    let body: Value = response
        .body_mut()
        .read_json()
        .unwrap_or(Value::Null);
    if !status.is_success() {
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| status.to_string());
        return Err(remote_err(context, message));
    }
    Ok(body)
}

/// REST client for the remote host.
pub struct HttpRemote {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            agent: build_http_agent()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Block until the operation behind an async response has finished.
    /// Synchronous responses return straight away.
    fn wait_async(&self, context: &str, project: &str, body: &Value) -> Result<()> {
        if body.get("type").and_then(Value::as_str) != Some("async") {
            return Ok(());
        }
        let id = parse_operation_id(body)
            .ok_or_else(|| remote_err(context, "response names no operation"))?;
        let url = self.url(&format!("/1.0/operations/{id}/wait?project={project}&timeout=-1"));
        tracing::debug!("GET {url}");
        let body = read_response(context, self.agent.get(&url).call())?;
        operation_result(&body).map_err(|e| remote_err(context, e))
    }
}

impl RemoteApi for HttpRemote {
    fn create(&self, spec: &CreateSpec) -> Result<(ResourceId, Box<dyn Operation>)> {
        let (url, response) = match spec {
            CreateSpec::Instance { project, spec } => {
                let url = self.url(&format!("/1.0/instances?project={project}"));
                let response = self.agent.post(&url).send_json(spec);
                (url, response)
            }
            CreateSpec::Volume { project, pool, spec } => {
                let url = self.url(&format!("/1.0/storage-pools/{pool}/volumes?project={project}"));
                let response = self.agent.post(&url).send_json(spec);
                (url, response)
            }
        };
        tracing::debug!("POST {url}");
        let body = read_response(&format!("failed to create {}", spec.name()), response)?;
        let (id, secret) = parse_created_operation(&body)
            .ok_or_else(|| remote_err("failed to create", "response carries no migration operation"))?;

        let project = match spec {
            CreateSpec::Instance { project, .. } | CreateSpec::Volume { project, .. } => project,
        };
        let operation = HttpOperation {
            agent: self.agent.clone(),
            url: self.url(&format!("/1.0/operations/{id}?project={project}")),
            endpoint: data_endpoint(&self.base_url, &id, &secret),
            id,
        };
        Ok((spec.resource_id(), Box::new(operation)))
    }

    fn delete(&self, id: &ResourceId) -> Result<()> {
        let url = match id {
            ResourceId::Instance { project, name } => {
                self.url(&format!("/1.0/instances/{name}?project={project}"))
            }
            ResourceId::Volume { project, pool, name } => self.url(&format!(
                "/1.0/storage-pools/{pool}/volumes/custom/{name}?project={project}"
            )),
        };
        tracing::debug!("DELETE {url}");
        let context = format!("failed to delete {id}");
        let body = read_response(&context, self.agent.delete(&url).call())?;
        let project = match id {
            ResourceId::Instance { project, .. } | ResourceId::Volume { project, .. } => project,
        };
        self.wait_async(&context, project, &body)
    }
}

struct HttpOperation {
    agent: ureq::Agent,
    url: String,
    id: String,
    endpoint: String,
}

impl Operation for HttpOperation {
    fn id(&self) -> &str {
        &self.id
    }

    fn data_endpoint(&self) -> &str {
        &self.endpoint
    }

    fn poll(&mut self) -> Result<OperationStatus> {
        let body = read_response(
            &format!("failed to query operation {}", self.id),
            self.agent.get(&self.url).call(),
        )?;
        Ok(parse_operation_status(&body))
    }
}

/// Extract the operation id and the filesystem websocket secret from an
/// async creation response.
fn parse_created_operation(body: &Value) -> Option<(String, String)> {
    let id = parse_operation_id(body)?;
    let secret = body
        .get("metadata")?
        .get("metadata")?
        .get("fs")?
        .as_str()?
        .to_string();
    Some((id, secret))
}

fn parse_operation_id(body: &Value) -> Option<String> {
    if let Some(id) = body
        .get("metadata")
        .and_then(|m| m.get("id"))
        .and_then(Value::as_str)
    {
        return Some(id.to_string());
    }
    body.get("operation")?
        .as_str()?
        .rsplit('/')
        .next()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Outcome of a finished operation, from a `/wait` response.
fn operation_result(body: &Value) -> std::result::Result<(), String> {
    match parse_operation_status(body) {
        OperationStatus::Succeeded => Ok(()),
        OperationStatus::Failed(err) => Err(err),
        OperationStatus::Running { .. } => Err("operation did not finish".to_string()),
    }
}

/// Websocket URL the transfer tool connects to.
fn data_endpoint(base_url: &str, id: &str, secret: &str) -> String {
    let base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base_url.to_string()
    };
    format!("{base}/1.0/operations/{id}/websocket?secret={secret}")
}

fn parse_operation_status(body: &Value) -> OperationStatus {
    let meta = body.get("metadata").unwrap_or(&Value::Null);
    match meta.get("status").and_then(Value::as_str).unwrap_or("") {
        "Success" => OperationStatus::Succeeded,
        "Failure" | "Cancelled" => {
            let err = meta
                .get("err")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .unwrap_or("operation failed without an error message");
            OperationStatus::Failed(err.to_string())
        }
        _ => {
            let progress = meta
                .get("metadata")
                .and_then(Value::as_object)
                .and_then(|m| {
                    m.iter()
                        .find(|(k, _)| k.ends_with("_progress"))
                        .and_then(|(_, v)| v.as_str())
                })
                .map(str::to_string);
            OperationStatus::Running { progress }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_created_operation() {
        let body = json!({
            "type": "async",
            "operation": "/1.0/operations/abc-123",
            "metadata": {
                "id": "abc-123",
                "class": "websocket",
                "metadata": {"control": "c-secret", "fs": "fs-secret"}
            }
        });
        assert_eq!(
            parse_created_operation(&body),
            Some(("abc-123".to_string(), "fs-secret".to_string()))
        );
    }

    #[test]
    fn test_parse_created_operation_id_from_path() {
        let body = json!({
            "operation": "/1.0/operations/xyz",
            "metadata": {"metadata": {"fs": "s"}}
        });
        assert_eq!(parse_created_operation(&body).unwrap().0, "xyz");
    }

    #[test]
    fn test_parse_created_operation_without_secret() {
        let body = json!({"metadata": {"id": "x", "metadata": {}}});
        assert!(parse_created_operation(&body).is_none());
    }

    #[test]
    fn test_parse_operation_id_of_delete_response() {
        let body = json!({
            "type": "async",
            "status_code": 100,
            "operation": "/1.0/operations/del-42",
            "metadata": {"class": "task", "status": "Running"}
        });
        assert_eq!(parse_operation_id(&body).as_deref(), Some("del-42"));
        assert!(parse_operation_id(&json!({"operation": ""})).is_none());
    }

    #[test]
    fn test_operation_result() {
        assert!(operation_result(&json!({"metadata": {"status": "Success"}})).is_ok());
        assert_eq!(
            operation_result(&json!({"metadata": {"status": "Failure", "err": "instance is busy"}})),
            Err("instance is busy".to_string())
        );
        assert!(operation_result(&json!({"metadata": {"status": "Running"}})).is_err());
    }

    #[test]
    fn test_data_endpoint_scheme() {
        assert_eq!(
            data_endpoint("https://host:8443", "op", "s"),
            "wss://host:8443/1.0/operations/op/websocket?secret=s"
        );
        assert_eq!(
            data_endpoint("http://host", "op", "s"),
            "ws://host/1.0/operations/op/websocket?secret=s"
        );
    }

    #[test]
    fn test_parse_operation_status() {
        let running = json!({"metadata": {"status": "Running", "metadata": {"fs_progress": "1.2GB (40MB/s)"}}});
        assert_eq!(
            parse_operation_status(&running),
            OperationStatus::Running {
                progress: Some("1.2GB (40MB/s)".to_string())
            }
        );

        let pending = json!({"metadata": {"status": "Pending"}});
        assert_eq!(
            parse_operation_status(&pending),
            OperationStatus::Running { progress: None }
        );

        let done = json!({"metadata": {"status": "Success"}});
        assert_eq!(parse_operation_status(&done), OperationStatus::Succeeded);

        let failed = json!({"metadata": {"status": "Failure", "err": "disk full"}});
        assert_eq!(
            parse_operation_status(&failed),
            OperationStatus::Failed("disk full".to_string())
        );
    }

    #[test]
    fn test_instance_spec_json() {
        let spec = InstanceSpec {
            name: "web01".into(),
            instance_type: "container".into(),
            architecture: "x86_64".into(),
            profiles: None,
            config: BTreeMap::new(),
            devices: BTreeMap::new(),
            source: MigrationSource::push(),
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["type"], "container");
        assert_eq!(value["source"]["type"], "migration");
        assert_eq!(value["source"]["mode"], "push");
        assert!(value.get("profiles").is_none());
    }

    #[test]
    fn test_resource_id_display() {
        let spec = CreateSpec::Volume {
            project: "default".into(),
            pool: "fast".into(),
            spec: VolumeSpec {
                name: "data".into(),
                volume_type: "custom".into(),
                content_type: "block".into(),
                source: MigrationSource::push(),
            },
        };
        assert_eq!(spec.resource_id().to_string(), "custom volume default/fast/data");
    }
}
