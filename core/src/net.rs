use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;

use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: String,
    pub params: HashMap<String, String>,
    pub user_agent: String,
}

impl TransferRequest {
    pub fn new(url: String, user_agent: String) -> Self {
        Self {
            url,
            params: HashMap::new(),
            user_agent,
        }
    }
}

/// A response ready to be drained.
pub struct TransferResponse {
    pub body: Option<Box<dyn Read + Send>>,
    /// Declared body length; zero or negative when the server did not say.
    pub content_length: i64,
}

impl TransferResponse {
    pub fn new(body: impl Read + Send + 'static, content_length: i64) -> Self {
        Self {
            body: Some(Box::new(body)),
            content_length,
        }
    }

    pub fn without_body(content_length: i64) -> Self {
        Self {
            body: None,
            content_length,
        }
    }
}

impl fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferResponse")
            .field("has_body", &self.body.is_some())
            .field("content_length", &self.content_length)
            .finish()
    }
}

pub trait HttpClient: Send + Sync {
    fn fetch(&self, req: &TransferRequest) -> CoreResult<TransferResponse>;
}

#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: Client,
}

impl ReqwestHttpClient {
    pub fn new(user_agent: &str) -> CoreResult<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestHttpClient {
    fn fetch(&self, req: &TransferRequest) -> CoreResult<TransferResponse> {
        let mut request = self
            .client
            .get(&req.url)
            .header(reqwest::header::USER_AGENT, req.user_agent.as_str());
        if !req.params.is_empty() {
            request = request.query(&req.params);
        }
        let resp = request
            .send()
            .map_err(|err| CoreError::Transport(err.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CoreError::Transport(format!(
                "download failed with status {}",
                status.as_u16()
            )));
        }
        let content_length = resp
            .content_length()
            .and_then(|value| i64::try_from(value).ok())
            .unwrap_or(-1);
        Ok(TransferResponse::new(resp, content_length))
    }
}
