//! HTTP 客户端模块 - Fragment REST API 的 reqwest 实现
//!
//! 接口：
//! - `GET    /v1/fragments?expand=1|0`
//! - `POST   /v1/fragments`
//! - `GET    /v1/fragments/{id}` / `GET /v1/fragments/{id}/info` / `GET /v1/fragments/{id}.{ext}`
//! - `PUT    /v1/fragments/{id}`
//! - `DELETE /v1/fragments/{id}`

use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::client::{Credentials, FragmentList, RemoteFragmentClient};
use crate::error::{FragmentsSDKError, Result};
use crate::sdk::HttpClientConfig;
use crate::storage::entities::{FragmentData, FragmentMetadata};
use crate::version;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// 列表响应 `{"status":"ok","fragments":[...]}`
#[derive(Debug, Deserialize)]
struct ListEnvelope<T> {
    #[serde(default = "Vec::new")]
    fragments: Vec<T>,
}

/// 单条响应 `{"status":"ok","fragment":{...}}`
#[derive(Debug, Deserialize)]
struct FragmentEnvelope {
    fragment: FragmentMetadata,
}

/// 错误响应 `{"status":"error","error":{"code":404,"message":"..."}}`
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// 基于 reqwest 的远端客户端
#[derive(Debug)]
pub struct HttpFragmentClient {
    client: Client,
    api_url: String,
    credentials: RwLock<Option<Credentials>>,
}

impl HttpFragmentClient {
    /// 创建新的 HTTP 客户端
    pub fn new(config: &HttpClientConfig, api_url: &str, credentials: Option<Credentials>) -> Result<Self> {
        let mut builder = Client::builder().user_agent(version::user_agent());

        if let Some(timeout) = config.connect_timeout_secs {
            builder = builder.connect_timeout(Duration::from_secs(timeout));
        }

        if let Some(timeout) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(timeout));
        }

        let client = builder
            .build()
            .map_err(|e| FragmentsSDKError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        let api_url = api_url.trim_end_matches('/').to_string();
        info!("✅ HTTP 客户端已创建 (api_url: {})", api_url);

        Ok(Self {
            client,
            api_url,
            credentials: RwLock::new(credentials),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// 登录/登出后替换凭证
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.write() = credentials;
    }

    fn fragment_url(&self, id: &str) -> String {
        format!("{}/v1/fragments/{}", self.api_url, id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &*self.credentials.read() {
            Some(Credentials::Basic { username, password }) => request.basic_auth(username, Some(password)),
            Some(Credentials::Bearer(token)) => request.bearer_auth(token),
            None => request,
        }
    }

    /// 发送请求，非 2xx 响应转换成对应的错误
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorEnvelope>(&body)
            .map(|envelope| envelope.error.message)
            .unwrap_or_else(|_| if body.is_empty() { status.to_string() } else { body });
        warn!("请求失败，HTTP 状态码: {}, 错误: {}", status, message);
        Err(FragmentsSDKError::from_status(status.as_u16(), message))
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| FragmentsSDKError::Serialization(format!("解析响应失败: {}", e)))
    }

    async fn data(response: Response) -> Result<FragmentData> {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let bytes = response.bytes().await?;
        Ok(FragmentData::new(content_type, bytes))
    }
}

#[async_trait::async_trait]
impl RemoteFragmentClient for HttpFragmentClient {
    async fn list(&self, expand: bool) -> Result<FragmentList> {
        let request = self
            .client
            .get(format!("{}/v1/fragments", self.api_url))
            .query(&[("expand", if expand { "1" } else { "0" })]);
        let response = self.send(request).await?;
        let list = if expand {
            FragmentList::Expanded(Self::json::<ListEnvelope<FragmentMetadata>>(response).await?.fragments)
        } else {
            FragmentList::Ids(Self::json::<ListEnvelope<String>>(response).await?.fragments)
        };
        debug!("获取 fragment 列表: {} 条 (expand={})", list.len(), expand);
        Ok(list)
    }

    async fn get_content(&self, id: &str) -> Result<FragmentData> {
        let response = self.send(self.client.get(self.fragment_url(id))).await?;
        Self::data(response).await
    }

    async fn get_metadata(&self, id: &str) -> Result<FragmentMetadata> {
        let response = self
            .send(self.client.get(format!("{}/info", self.fragment_url(id))))
            .await?;
        Ok(Self::json::<FragmentEnvelope>(response).await?.fragment)
    }

    async fn create(&self, content_type: &str, content: Bytes) -> Result<FragmentMetadata> {
        let request = self
            .client
            .post(format!("{}/v1/fragments", self.api_url))
            .header(CONTENT_TYPE, content_type)
            .body(content);
        let fragment = Self::json::<FragmentEnvelope>(self.send(request).await?).await?.fragment;
        info!("📤 fragment 已创建: id={}, type={}", fragment.id, fragment.content_type);
        Ok(fragment)
    }

    async fn update(&self, id: &str, content: Bytes, target_type: &str) -> Result<FragmentMetadata> {
        let request = self
            .client
            .put(self.fragment_url(id))
            .header(CONTENT_TYPE, target_type)
            .body(content);
        let fragment = Self::json::<FragmentEnvelope>(self.send(request).await?).await?.fragment;
        info!("fragment 已更新: id={}, type={}", fragment.id, fragment.content_type);
        Ok(fragment)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.send(self.client.delete(self.fragment_url(id))).await?;
        info!("fragment 已删除: id={}", id);
        Ok(())
    }

    async fn convert(&self, id: &str, extension: &str) -> Result<FragmentData> {
        let extension = extension.trim_start_matches('.');
        if extension.is_empty() {
            return Err(FragmentsSDKError::InvalidArgument("扩展名不能为空".to_string()));
        }
        let url = format!("{}.{}", self.fragment_url(id), extension);
        let response = self.send(self.client.get(url)).await?;
        Self::data(response).await
    }

    async fn ping(&self) -> bool {
        // 能拿到任何 HTTP 响应就说明服务器可达
        match self.authorize(self.client.get(format!("{}/", self.api_url))).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("连通性探测失败: {}", e);
                false
            }
        }
    }
}
