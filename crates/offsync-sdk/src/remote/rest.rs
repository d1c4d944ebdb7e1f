//! REST 远端适配器
//!
//! 按 PostgREST 风格把条目映射为 HTTP 调用：
//!
//! | 操作 | 请求 |
//! |------|------|
//! | insert | `POST /{table}` |
//! | upsert | `POST /{table}` + `Prefer: resolution=merge-duplicates` |
//! | update | `PATCH /{table}?{pk}=eq.{key}` |
//! | delete | `DELETE /{table}?{pk}=eq.{key}` |
//! | 快照 | `GET /{table}?select=*` |
//!
//! 实时变更流读取 `GET {realtime_url}/{table}` 的 SSE 流，每个 `data:` 是一个 ChangeEvent JSON。

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::sse::SseDecoder;
use super::{ChangeEvent, ChangeFeed, FeedSignal, RemoteClient};
use crate::error::{RemoteError, Result, SyncSDKError};
use crate::feed_backoff::{FeedBackoff, FeedBackoffConfig};
use crate::storage::queue::{MutationOp, OutboxEntry};

/// REST 适配器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestRemoteConfig {
    /// REST 根地址，如 `https://example.com/rest/v1`
    pub base_url: String,
    /// 变更流根地址；None 时使用 `{base_url}/changes`
    pub realtime_url: Option<String>,
    /// `apikey` 请求头
    pub api_key: Option<String>,
    /// `Authorization: Bearer` 令牌
    pub bearer_token: Option<String>,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 单次请求超时（秒），不作用于变更流
    pub request_timeout_secs: u64,
    /// 主键字段
    pub primary_key_field: String,
    /// 变更流缓冲
    pub feed_buffer: usize,
    /// 变更流重连节奏
    pub reconnect: FeedBackoffConfig,
}

impl Default for RestRemoteConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            realtime_url: None,
            api_key: None,
            bearer_token: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 30,
            primary_key_field: "id".to_string(),
            feed_buffer: 256,
            reconnect: FeedBackoffConfig::default(),
        }
    }
}

/// PostgREST 风格的远端客户端
#[derive(Debug, Clone)]
pub struct RestRemoteClient {
    client: Client,
    config: Arc<RestRemoteConfig>,
}

impl RestRemoteClient {
    pub fn new(config: RestRemoteConfig) -> Result<Self> {
        if config.base_url.is_empty() {
            return Err(SyncSDKError::Config("base_url 不能为空".to_string()));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| SyncSDKError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;
        info!("REST 远端客户端已创建 (base_url: {})", config.base_url);
        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), table)
    }

    fn feed_url(&self, table: &str) -> String {
        match &self.config.realtime_url {
            Some(url) => format!("{}/{}", url.trim_end_matches('/'), table),
            None => format!("{}/changes/{}", self.config.base_url.trim_end_matches('/'), table),
        }
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        authorize(&self.config, builder)
    }

    fn key_filter(&self, entry: &OutboxEntry) -> [(String, String); 1] {
        [(
            self.config.primary_key_field.clone(),
            format!("eq.{}", entry.key),
        )]
    }

    fn request_for(&self, entry: &OutboxEntry) -> RequestBuilder {
        let url = self.table_url(&entry.table);
        let row = entry.row_with_key(&self.config.primary_key_field);
        let builder = match entry.operation {
            // 重放已提交的插入时忽略重复主键，不返回 409
            MutationOp::Insert => self
                .client
                .post(url)
                .header("Prefer", "return=representation,resolution=ignore-duplicates")
                .json(&row),
            MutationOp::Upsert => self
                .client
                .post(url)
                .header("Prefer", "return=representation,resolution=merge-duplicates")
                .json(&row),
            MutationOp::Update => self
                .client
                .patch(url)
                .query(&self.key_filter(entry))
                .json(&entry.data),
            MutationOp::Delete => self.client.delete(url).query(&self.key_filter(entry)),
        };
        let builder = match entry.operation {
            MutationOp::Insert | MutationOp::Upsert => builder,
            _ => builder.header("Prefer", "return=representation"),
        };
        self.authorize(builder)
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
    }
}

fn authorize(config: &RestRemoteConfig, mut builder: RequestBuilder) -> RequestBuilder {
    if let Some(key) = &config.api_key {
        builder = builder.header("apikey", key);
    }
    if let Some(token) = &config.bearer_token {
        builder = builder.bearer_auth(token);
    }
    builder
}

/// 请求层错误分类：构造请求失败是永久错误，其余（连接、超时、读取）都可重试
fn classify_request_error(error: reqwest::Error) -> RemoteError {
    if error.is_builder() {
        return RemoteError::rejected(format!("构造请求失败: {}", error));
    }
    match error.status() {
        Some(status) => RemoteError::from_status(status.as_u16(), error.to_string()),
        None => RemoteError::transient(error.to_string()),
    }
}

async fn ensure_success(response: Response) -> std::result::Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::from_status(status.as_u16(), body))
}

/// PostgREST 返回数组；取第一行
fn first_row(body: Value) -> Option<Value> {
    match body {
        Value::Array(rows) => rows.into_iter().next(),
        Value::Null => None,
        other => Some(other),
    }
}

#[async_trait]
impl RemoteClient for RestRemoteClient {
    async fn apply(&self, entry: &OutboxEntry) -> std::result::Result<Option<Value>, RemoteError> {
        debug!(entry_id = entry.id, table = %entry.table, key = %entry.key, op = %entry.operation, "REST apply");
        let response = self
            .request_for(entry)
            .send()
            .await
            .map_err(classify_request_error)?;
        let response = ensure_success(response).await?;

        if entry.operation == MutationOp::Delete {
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(classify_request_error)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let body: Value = serde_json::from_slice(&bytes)
            .map_err(|e| RemoteError::transient(format!("无法解析远端响应: {}", e)))?;
        Ok(first_row(body))
    }

    async fn fetch_snapshot(&self, table: &str) -> std::result::Result<Vec<Value>, RemoteError> {
        let builder = self
            .client
            .get(self.table_url(table))
            .query(&[("select", "*")])
            .timeout(Duration::from_secs(self.config.request_timeout_secs));
        let response = self
            .authorize(builder)
            .send()
            .await
            .map_err(classify_request_error)?;
        let response = ensure_success(response).await?;
        let body: Value = response.json().await.map_err(classify_request_error)?;
        match body {
            Value::Array(rows) => Ok(rows),
            other => Err(RemoteError::rejected(format!("快照不是数组: {}", other))),
        }
    }

    async fn subscribe(&self, table: &str) -> std::result::Result<ChangeFeed, RemoteError> {
        let response = open_feed(&self.client, &self.config, &self.feed_url(table)).await?;
        let (tx, rx) = mpsc::channel(self.config.feed_buffer.max(1));
        let task = tokio::spawn(run_feed(
            self.client.clone(),
            self.config.clone(),
            self.feed_url(table),
            table.to_string(),
            response,
            tx,
        ));
        info!("已订阅变更流: {}", table);
        Ok(ChangeFeed::new(table, rx, Some(task)))
    }
}

async fn open_feed(client: &Client, config: &RestRemoteConfig, url: &str) -> std::result::Result<Response, RemoteError> {
    let builder = client.get(url).header("Accept", "text/event-stream");
    let response = authorize(config, builder)
        .send()
        .await
        .map_err(classify_request_error)?;
    ensure_success(response).await
}

/// 读取变更流，断开后按重连节奏自动重连
async fn run_feed(
    client: Client,
    config: Arc<RestRemoteConfig>,
    url: String,
    table: String,
    first: Response,
    tx: mpsc::Sender<FeedSignal>,
) {
    let backoff = FeedBackoff::new(table.clone(), config.reconnect.clone());
    backoff.connected();
    let mut response = Some(first);

    loop {
        if let Some(open) = response.take() {
            let reason = read_stream(open, &table, &tx).await;
            if tx.is_closed() {
                break;
            }
            warn!("变更流断开: table={}, reason={}", table, reason);
            if tx.send(FeedSignal::Dropped(reason)).await.is_err() {
                break;
            }
        }

        tokio::time::sleep(backoff.next_delay()).await;
        match open_feed(&client, &config, &url).await {
            Ok(open) => {
                backoff.connected();
                info!("变更流已重连: {}", table);
                if tx.send(FeedSignal::Reconnected).await.is_err() {
                    break;
                }
                response = Some(open);
            }
            Err(e) => {
                debug!("变更流重连失败: table={}, error={}", table, e);
                if tx.is_closed() {
                    break;
                }
            }
        }
    }
    debug!("变更流任务退出: {}", table);
}

/// 读到流结束或出错为止，返回断开原因
async fn read_stream(response: Response, table: &str, tx: &mpsc::Sender<FeedSignal>) -> String {
    let mut decoder = SseDecoder::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return e.to_string(),
        };
        for payload in decoder.push(&chunk) {
            match serde_json::from_str::<ChangeEvent>(&payload) {
                Ok(mut event) => {
                    if event.table.is_empty() {
                        event.table = table.to_string();
                    }
                    if tx.send(FeedSignal::Event(event)).await.is_err() {
                        return "订阅已关闭".to_string();
                    }
                }
                Err(e) => warn!("无法解析变更事件: table={}, error={}", table, e),
            }
        }
    }
    "服务端关闭了变更流".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queue::EntryStatus;
    use serde_json::json;

    fn client() -> RestRemoteClient {
        RestRemoteClient::new(RestRemoteConfig {
            base_url: "https://db.example.com/rest/v1/".to_string(),
            api_key: Some("anon".to_string()),
            ..Default::default()
        })
        .unwrap()
    }

    fn entry(operation: MutationOp, data: Option<Value>) -> OutboxEntry {
        OutboxEntry {
            id: 7,
            operation,
            table: "goals".to_string(),
            key: "g 1".into(),
            data,
            attempts: 0,
            status: EntryStatus::Pending,
            created_at: 0,
            last_error: None,
            next_attempt_at: None,
            parked_at: None,
        }
    }

    #[test]
    fn test_request_mapping() {
        let client = client();

        let req = client
            .request_for(&entry(MutationOp::Upsert, Some(json!({"count": 1}))))
            .build()
            .unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        assert_eq!(req.url().as_str(), "https://db.example.com/rest/v1/goals");
        assert!(req.headers()["Prefer"].to_str().unwrap().contains("merge-duplicates"));
        assert_eq!(req.headers()["apikey"], "anon");
        let body: Value = serde_json::from_slice(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body, json!({"id": "g 1", "count": 1}));

        let req = client
            .request_for(&entry(MutationOp::Insert, Some(json!({"count": 1}))))
            .build()
            .unwrap();
        assert_eq!(req.method(), reqwest::Method::POST);
        let prefer = req.headers()["Prefer"].to_str().unwrap();
        assert!(prefer.contains("ignore-duplicates"));
        assert!(prefer.contains("return=representation"));

        let req = client
            .request_for(&entry(MutationOp::Update, Some(json!({"count": 2}))))
            .build()
            .unwrap();
        assert_eq!(req.method(), reqwest::Method::PATCH);
        assert_eq!(req.url().query(), Some("id=eq.g+1"));

        let req = client.request_for(&entry(MutationOp::Delete, None)).build().unwrap();
        assert_eq!(req.method(), reqwest::Method::DELETE);
        assert!(req.body().is_none());
    }

    #[test]
    fn test_feed_url_and_first_row() {
        let client = client();
        assert_eq!(client.feed_url("goals"), "https://db.example.com/rest/v1/changes/goals");
        assert_eq!(first_row(json!([{"id": 1}, {"id": 2}])), Some(json!({"id": 1})));
        assert_eq!(first_row(json!([])), None);
        assert!(RestRemoteClient::new(RestRemoteConfig::default()).is_err());
    }
}
