//! HTTP fetch task with an outbound network policy.

use std::collections::BTreeMap;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::warn;
use url::Url;

use super::{bool_option, json_map_option, require_option, Task, TaskContext, TaskType};
use crate::dag::{ParseError, TaskNode};
use crate::result::{TaskError, TaskResult};
use crate::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            _ => None,
        }
    }
}

/// Fetches one URL and emits the response body as a string value.
#[derive(Clone, Debug)]
pub struct HttpTask {
    pub url: Url,
    pub method: HttpMethod,
    pub request_data: BTreeMap<String, Value>,
    /// Tri-state: unset falls back to the runner-wide default.
    pub allow_unrestricted_network_access: Option<bool>,
}

impl HttpTask {
    pub fn from_node(node: &TaskNode) -> Result<Self, ParseError> {
        let raw_url = require_option(node, "url")?;
        let url = Url::parse(raw_url).map_err(|err| ParseError::InvalidOption {
            dot_id: node.dot_id.clone(),
            key: "url",
            message: err.to_string(),
        })?;

        let method = match node.options.get("method") {
            None => HttpMethod::Get,
            Some(raw) => HttpMethod::parse(raw).ok_or_else(|| ParseError::InvalidOption {
                dot_id: node.dot_id.clone(),
                key: "method",
                message: format!("unsupported HTTP method \"{raw}\""),
            })?,
        };

        Ok(Self {
            url,
            method,
            request_data: json_map_option(node, "requestdata")?,
            allow_unrestricted_network_access: bool_option(
                node,
                "allowunrestrictednetworkaccess",
            )?,
        })
    }

    /// One logical fetch: policy check, bounded retries on transient
    /// transport errors, capped body read. HTTP status errors are
    /// definitive and never retried.
    pub(crate) async fn fetch(&self, ctx: &TaskContext) -> Result<Value, TaskError> {
        let allow_unrestricted = self.allow_unrestricted_network_access.unwrap_or(
            ctx.config.default_http_allow_unrestricted_network_access,
        );
        if !allow_unrestricted && url_is_restricted(&self.url) {
            return Err(TaskError::InsecureUrl(self.url.to_string()));
        }

        let body = match self.method {
            HttpMethod::Get => None,
            HttpMethod::Post => Some(Value::Map(self.request_data.clone()).to_json()),
        };

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut request = ctx
                .client
                .request(self.method.as_reqwest(), self.url.clone())
                .timeout(ctx.config.default_http_timeout);
            if let Some(json) = &body {
                request = request.json(json);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if !status.is_success() {
                        return Err(TaskError::BadResponse {
                            status: status.as_u16(),
                        });
                    }
                    return read_capped_body(response, ctx.config.http_max_response_bytes).await;
                }
                Err(err) if is_transient(&err) && attempt <= ctx.config.http_max_retries => {
                    warn!(
                        url = %self.url,
                        attempt,
                        error = %err,
                        "transient HTTP error, retrying"
                    );
                }
                Err(err) => return Err(TaskError::Http(err.to_string())),
            }
        }
    }
}

#[async_trait]
impl Task for HttpTask {
    fn task_type(&self) -> TaskType {
        TaskType::Http
    }

    async fn run(&self, ctx: &TaskContext, inputs: &[TaskResult]) -> TaskResult {
        if !inputs.is_empty() {
            return TaskResult::err(TaskError::WrongInputCardinality {
                task: "HttpTask",
                want: 0,
                got: inputs.len(),
            });
        }
        match self.fetch(ctx).await {
            Ok(value) => TaskResult::ok(value),
            Err(error) => TaskResult::err(error),
        }
    }
}

async fn read_capped_body(mut response: reqwest::Response, limit: usize) -> Result<Value, TaskError> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|err| TaskError::Http(err.to_string()))?
    {
        if body.len() + chunk.len() > limit {
            return Err(TaskError::ResponseTooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(Value::String(String::from_utf8_lossy(&body).into_owned()))
}

fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

/// Loopback, private and link-local destinations are refused unless the
/// task (or the runner default) opts into unrestricted access.
fn url_is_restricted(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return true;
    };
    if host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost")
    {
        return true;
    }
    match host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            ip.is_loopback() || ip.is_private() || ip.is_link_local() || ip.is_unspecified()
        }
        Ok(IpAddr::V6(ip)) => ip.is_loopback() || ip.is_unspecified(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Pipeline;

    fn http_node(source: &str) -> TaskNode {
        Pipeline::parse(source).unwrap().node(0).clone()
    }

    #[test]
    fn from_node_parses_url_method_and_access_flag() {
        let node = http_node(
            r#"ds1 [type=http method=POST url="http://example.com/price" allowunrestrictednetworkaccess="true"];"#,
        );
        let task = HttpTask::from_node(&node).unwrap();
        assert_eq!(task.method, HttpMethod::Post);
        assert_eq!(task.url.as_str(), "http://example.com/price");
        assert_eq!(task.allow_unrestricted_network_access, Some(true));
    }

    #[test]
    fn method_defaults_to_get_and_flag_to_unset() {
        let node = http_node(r#"ds1 [type=http url="http://example.com"];"#);
        let task = HttpTask::from_node(&node).unwrap();
        assert_eq!(task.method, HttpMethod::Get);
        assert_eq!(task.allow_unrestricted_network_access, None);
    }

    #[test]
    fn bad_method_and_missing_url_are_rejected() {
        let node = http_node(r#"ds1 [type=http method=BREW url="http://example.com"];"#);
        assert!(HttpTask::from_node(&node).is_err());

        let node = http_node(r#"ds1 [type=http method=GET];"#);
        assert!(HttpTask::from_node(&node).is_err());
    }

    #[test]
    fn restricted_hosts() {
        for restricted in [
            "http://127.0.0.1:8080/",
            "http://localhost/price",
            "http://10.0.0.4/",
            "http://192.168.1.1/",
            "http://169.254.0.1/",
            "http://[::1]/",
        ] {
            assert!(url_is_restricted(&Url::parse(restricted).unwrap()), "{restricted}");
        }
        for public in ["http://93.184.216.34/", "http://example.com/"] {
            assert!(!url_is_restricted(&Url::parse(public).unwrap()), "{public}");
        }
    }
}
