pub mod types;

use crate::config::{AgentConfig, AuthScheme};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

pub use types::{
    ConfigPayload, DistributionConfig, Envelope, HeartbeatRequest, InstanceStatusReport,
    InstanceTraffic, RemoteInstance, StatusReport, TrafficReport,
};

/// 错误路径上最多读取的响应体字节数
pub const MAX_ERROR_BODY_BYTES: usize = 1024;

const CONFIG_ENDPOINT: &str = "/api/agent/config";
const HEARTBEAT_ENDPOINT: &str = "/api/agent/heartbeat";
const TRAFFIC_ENDPOINT: &str = "/api/agent/traffic";
const STATUS_ENDPOINT: &str = "/api/agent/status";
const DISTRIBUTION_ENDPOINT: &str = "/api/agent/snell-config";

/// 客户端错误类型
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client configuration error: {0}")]
    Config(String),

    #[error("request {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },

    #[error("http request failed: status={status} body={body}")]
    Status { status: u16, body: String },

    #[error("master returned code {code}: {message}")]
    Api { code: i64, message: String },

    #[error("master response for {0} carried no data")]
    EmptyPayload(&'static str),

    #[error("failed to read response body: {0}")]
    Body(#[source] reqwest::Error),

    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("download io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// 传输层错误（已经按重试预算重试过）
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport { .. })
    }
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: String,
    pub auth_scheme: AuthScheme,
    pub auth_header: String,
    pub max_retries: u32,
    pub timeout: Duration,
    /// 线性退避步长，第 n 次重试前等待 n * retry_backoff
    pub retry_backoff: Duration,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            auth_scheme: AuthScheme::Header,
            auth_header: "X-API-Token".to_string(),
            max_retries: 1,
            timeout: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(200),
        }
    }

    pub fn from_agent(agent: &AgentConfig) -> Self {
        Self {
            base_url: agent.master_url.clone(),
            token: agent.api_token.clone(),
            auth_scheme: agent.auth_scheme,
            auth_header: agent.auth_header.clone(),
            max_retries: agent.max_retries,
            timeout: Duration::from_secs(agent.request_timeout_secs.max(1)),
            retry_backoff: Duration::from_millis(200),
        }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_auth_scheme(mut self, scheme: AuthScheme) -> Self {
        self.auth_scheme = scheme;
        self
    }
}

/// Master 客户端 - 带重试与鉴权的 HTTP 传输层
pub struct MasterClient {
    base_url: String,
    auth: Option<(HeaderName, HeaderValue)>,
    http: Client,
    max_retries: u32,
    retry_backoff: Duration,
}

impl MasterClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build http client: {}", e)))?;

        let token = config.token.trim();
        let auth = if token.is_empty() {
            None
        } else {
            Some(Self::auth_header(&config, token)?)
        };

        Ok(Self {
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            auth,
            http,
            max_retries: config.max_retries,
            retry_backoff: config.retry_backoff,
        })
    }

    fn auth_header(
        config: &ClientConfig,
        token: &str,
    ) -> Result<(HeaderName, HeaderValue), ClientError> {
        let (name, value) = match config.auth_scheme {
            AuthScheme::Bearer => (AUTHORIZATION, format!("Bearer {}", token)),
            AuthScheme::Header => {
                let name = HeaderName::from_bytes(config.auth_header.trim().as_bytes())
                    .map_err(|_| {
                        ClientError::Config(format!("invalid auth header '{}'", config.auth_header))
                    })?;
                (name, token.to_string())
            }
        };
        let mut value = HeaderValue::from_str(&value)
            .map_err(|_| ClientError::Config("api token contains invalid characters".to_string()))?;
        value.set_sensitive(true);
        Ok((name, value))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// 拼接完整 URL；绝对地址原样返回
    pub fn build_url(&self, endpoint: &str) -> Result<String, ClientError> {
        let endpoint = endpoint.trim();
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return Ok(endpoint.to_string());
        }
        if self.base_url.is_empty() {
            return Err(ClientError::Config("base url is not configured".to_string()));
        }
        if endpoint.starts_with('/') {
            Ok(format!("{}{}", self.base_url, endpoint))
        } else {
            Ok(format!("{}/{}", self.base_url, endpoint))
        }
    }

    /// scheme、host、port 都与 Master 一致才算同源
    pub fn is_master_origin(&self, url: &str) -> bool {
        let (Ok(target), Ok(base)) = (Url::parse(url), Url::parse(&self.base_url)) else {
            return false;
        };
        target.scheme() == base.scheme()
            && target.host_str() == base.host_str()
            && target.port_or_known_default() == base.port_or_known_default()
    }

    /// 拉取实例期望状态
    pub async fn fetch_config(&self) -> Result<Vec<RemoteInstance>, ClientError> {
        let payload: ConfigPayload = self
            .call(Method::GET, CONFIG_ENDPOINT, None::<&()>)
            .await?
            .ok_or(ClientError::EmptyPayload("config"))?;
        Ok(payload.instances)
    }

    pub async fn report_heartbeat(&self, heartbeat: &HeartbeatRequest) -> Result<(), ClientError> {
        self.call::<_, serde_json::Value>(Method::POST, HEARTBEAT_ENDPOINT, Some(heartbeat))
            .await?;
        Ok(())
    }

    pub async fn report_traffic(&self, traffic: &[InstanceTraffic]) -> Result<(), ClientError> {
        let body = TrafficReport { traffic };
        self.call::<_, serde_json::Value>(Method::POST, TRAFFIC_ENDPOINT, Some(&body))
            .await?;
        Ok(())
    }

    pub async fn report_status(
        &self,
        statuses: &[InstanceStatusReport],
    ) -> Result<(), ClientError> {
        let body = StatusReport { statuses };
        self.call::<_, serde_json::Value>(Method::POST, STATUS_ENDPOINT, Some(&body))
            .await?;
        Ok(())
    }

    /// 拉取 snell-server 下载配置
    pub async fn fetch_distribution_config(&self) -> Result<DistributionConfig, ClientError> {
        self.call(Method::GET, DISTRIBUTION_ENDPOINT, None::<&()>)
            .await?
            .ok_or(ClientError::EmptyPayload("distribution config"))
    }

    /// 下载文件到 dest；只有指向 Master 的地址才附带鉴权头
    pub async fn download_to(
        &self,
        url: &str,
        dest: &Path,
        deadline: Duration,
    ) -> Result<u64, ClientError> {
        let url = self.build_url(url)?;
        let with_auth = self.is_master_origin(&url);
        let mut response = self
            .send(Method::GET, &url, None, Some(deadline), with_auth)
            .await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(ClientError::Body)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        debug!("Downloaded {} bytes from {}", written, url);
        Ok(written)
    }

    /// 发送请求并解析 {code, message, data} 信封
    async fn call<B, T>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&B>,
    ) -> Result<Option<T>, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.build_url(endpoint)?;
        let payload = match body {
            Some(body) => Some(serde_json::to_vec(body)?),
            None => None,
        };

        let response = self.send(method, &url, payload, None, true).await?;
        let bytes = response.bytes().await.map_err(ClientError::Body)?;

        let envelope: Envelope<T> = serde_json::from_slice(&bytes)?;
        if envelope.code != 0 {
            return Err(ClientError::Api {
                code: envelope.code,
                message: envelope.message,
            });
        }
        Ok(envelope.data)
    }

    /// 重试循环：只有传输层错误会重试，非 2xx 直接返回
    async fn send(
        &self,
        method: Method,
        url: &str,
        payload: Option<Vec<u8>>,
        deadline: Option<Duration>,
        with_auth: bool,
    ) -> Result<Response, ClientError> {
        let mut attempt: u32 = 0;

        loop {
            let mut request = self
                .http
                .request(method.clone(), url)
                .header(ACCEPT, "application/json");
            if let Some(body) = &payload {
                request = request
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone());
            }
            if let Some(deadline) = deadline {
                request = request.timeout(deadline);
            }
            if with_auth {
                if let Some((name, value)) = &self.auth {
                    request = request.header(name.clone(), value.clone());
                }
            }

            match request.send().await {
                Ok(response) => return Self::check_status(response).await,
                Err(err) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        "Request {} {} failed (attempt {}/{}): {}",
                        method,
                        url,
                        attempt,
                        self.max_retries + 1,
                        err
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                Err(err) => {
                    return Err(ClientError::Transport {
                        url: url.to_string(),
                        attempts: attempt + 1,
                        source: err,
                    });
                }
            }
        }
    }

    async fn check_status(response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = read_capped(response, MAX_ERROR_BODY_BYTES).await;
        Err(ClientError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// 读取至多 limit 字节的响应体
async fn read_capped(mut response: Response, limit: usize) -> String {
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = (limit - buf.len()).min(chunk.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            _ => break,
        }
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use warp::Filter;

    fn status_of(err: &ClientError) -> Option<StatusCode> {
        match err {
            ClientError::Status { status, .. } => StatusCode::from_u16(*status).ok(),
            _ => None,
        }
    }

    fn serve<F>(filter: F) -> SocketAddr
    where
        F: Filter + Clone + Send + Sync + 'static,
        F::Extract: warp::Reply,
    {
        let (addr, server) = warp::serve(filter).bind_ephemeral(([127, 0, 0, 1], 0));
        tokio::spawn(server);
        addr
    }

    fn client_for(addr: SocketAddr) -> MasterClient {
        let config = ClientConfig::new(format!("http://{}/", addr), "secret-token")
            .with_retry_backoff(Duration::from_millis(10));
        MasterClient::new(config).unwrap()
    }

    #[test]
    fn test_build_url() {
        let client =
            MasterClient::new(ClientConfig::new("https://master.example.com/ ", "t")).unwrap();

        assert_eq!(
            client.build_url("/api/agent/config").unwrap(),
            "https://master.example.com/api/agent/config"
        );
        assert_eq!(
            client.build_url("api/agent/config").unwrap(),
            "https://master.example.com/api/agent/config"
        );
        assert_eq!(
            client.build_url("https://cdn.example.com/snell.zip").unwrap(),
            "https://cdn.example.com/snell.zip"
        );

        let empty = MasterClient::new(ClientConfig::new("", "t")).unwrap();
        assert!(matches!(
            empty.build_url("/api/agent/config"),
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_config_with_header_auth() {
        let route = warp::get()
            .and(warp::path!("api" / "agent" / "config"))
            .and(warp::header::<String>("x-api-token"))
            .map(|token: String| {
                assert_eq!(token, "secret-token");
                warp::reply::json(&serde_json::json!({
                    "code": 0,
                    "message": "ok",
                    "data": {"instances": [
                        {"id": 1, "user_id": 7, "username": "alice",
                         "port": 9000, "psk": "p1", "version": 4},
                        {"id": 2, "user_id": 8, "username": "bob",
                         "port": 9001, "psk": "p2", "version": 4, "obfs": "tls"}
                    ]}
                }))
            });
        let client = client_for(serve(route));

        let instances = client.fetch_config().await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances[0].port, 9000);
        assert_eq!(instances[0].obfs, "");
        assert_eq!(instances[1].obfs, "tls");
    }

    #[tokio::test]
    async fn test_bearer_auth() {
        let route = warp::path!("api" / "agent" / "heartbeat")
            .and(warp::header::<String>("authorization"))
            .and(warp::body::json())
            .map(|auth: String, body: serde_json::Value| {
                assert_eq!(auth, "Bearer secret-token");
                assert_eq!(body["instance_count"], 3);
                warp::reply::json(&serde_json::json!({"code": 0, "message": "ok"}))
            });
        let addr = serve(route);
        let config = ClientConfig::new(format!("http://{}", addr), "secret-token")
            .with_auth_scheme(AuthScheme::Bearer);
        let client = MasterClient::new(config).unwrap();

        let heartbeat = HeartbeatRequest {
            cpu_usage: 10,
            memory_usage: 20,
            instance_count: 3,
            version: "1.0.0".to_string(),
        };
        client.report_heartbeat(&heartbeat).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_error_is_not_retried_and_truncated() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let route = warp::any().map(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            warp::reply::with_status("x".repeat(5000), warp::http::StatusCode::BAD_GATEWAY)
        });
        let addr = serve(route);
        let config = ClientConfig::new(format!("http://{}", addr), "t")
            .with_max_retries(3)
            .with_retry_backoff(Duration::from_millis(10));
        let client = MasterClient::new(config).unwrap();

        let err = client.fetch_config().await.unwrap_err();
        match &err {
            ClientError::Status { status, body } => {
                assert_eq!(*status, 502);
                assert_eq!(body.len(), MAX_ERROR_BODY_BYTES);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(status_of(&err), Some(StatusCode::BAD_GATEWAY));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_api_error_code() {
        let route = warp::any().map(|| {
            warp::reply::json(&serde_json::json!({"code": 401, "message": "invalid token"}))
        });
        let client = client_for(serve(route));

        let traffic = vec![InstanceTraffic {
            instance_id: 1,
            bytes_upload: 5,
            bytes_download: 5,
        }];
        let err = client.report_traffic(&traffic).await.unwrap_err();
        assert!(matches!(err, ClientError::Api { code: 401, .. }));
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_missing_config_payload() {
        let route = warp::any().map(|| warp::reply::json(&serde_json::json!({"code": 0})));
        let client = client_for(serve(route));

        let err = client.fetch_config().await.unwrap_err();
        assert!(matches!(err, ClientError::EmptyPayload("config")));
    }

    #[tokio::test]
    async fn test_missing_code_counts_as_success() {
        let route = warp::any().map(|| {
            warp::reply::json(&serde_json::json!({
                "data": {"instances": [{"id": 3, "port": 9100, "psk": "k"}]}
            }))
        });
        let client = client_for(serve(route));

        let instances = client.fetch_config().await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].id, 3);
    }

    #[tokio::test]
    async fn test_transport_retry_budget() {
        // 接受连接后立即关闭，触发传输层错误
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });

        let config = ClientConfig::new(format!("http://{}", addr), "t")
            .with_max_retries(2)
            .with_retry_backoff(Duration::from_millis(10));
        let client = MasterClient::new(config).unwrap();

        let err = client.fetch_config().await.unwrap_err();
        match err {
            ClientError::Transport { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(accepts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_master_origin_matching() {
        let client =
            MasterClient::new(ClientConfig::new("http://127.0.0.1:3806/", "t")).unwrap();
        assert!(client.is_master_origin("http://127.0.0.1:3806/files/snell.zip"));
        assert!(!client.is_master_origin("http://127.0.0.1:38063/files/snell.zip"));
        assert!(!client.is_master_origin("https://127.0.0.1:3806/files/snell.zip"));
        assert!(!client.is_master_origin("not a url"));

        let client =
            MasterClient::new(ClientConfig::new("https://master.example.com", "t")).unwrap();
        assert!(client.is_master_origin("https://master.example.com:443/a"));
        assert!(!client.is_master_origin("https://master.example.com.cdn.net/a"));
    }

    #[tokio::test]
    async fn test_download_skips_token_for_foreign_host() {
        let seen: Arc<std::sync::Mutex<Vec<Option<String>>>> = Arc::default();
        let sink = seen.clone();
        let route = warp::path!("files" / "snell.zip")
            .and(warp::header::optional::<String>("x-api-token"))
            .map(move |token: Option<String>| {
                sink.lock().unwrap().push(token);
                "archive-bytes"
            });
        let addr = serve(route);
        let url = format!("http://{}/files/snell.zip", addr);
        let dir = tempfile::tempdir().unwrap();

        // 基础地址是目标地址的文本前缀，但端口不同
        let base = format!("http://127.0.0.1:{}", addr.port() / 10);
        let foreign = MasterClient::new(ClientConfig::new(base, "secret-token")).unwrap();
        foreign
            .download_to(&url, &dir.path().join("a.zip"), Duration::from_secs(5))
            .await
            .unwrap();

        let master = client_for(addr);
        master
            .download_to(&url, &dir.path().join("b.zip"), Duration::from_secs(5))
            .await
            .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![None, Some("secret-token".to_string())]);
    }

    #[tokio::test]
    async fn test_download_to_file() {
        let route = warp::path!("files" / "snell.zip").map(|| "archive-bytes");
        let addr = serve(route);
        let client = client_for(addr);
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("snell.zip");

        let written = client
            .download_to(
                &format!("http://{}/files/snell.zip", addr),
                &dest,
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(written, 13);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "archive-bytes");
    }
}
