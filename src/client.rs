//! HTTP clients for a remote bookchat server, so a conversation can run in a
//! different process from the catalog and the model.

use async_trait::async_trait;
use reqwest::StatusCode;
use url::Url;

use crate::book::Book;
use crate::conversation::{ChatCompletion, CompletionRequest, CompletionResponse, EntityLookup};
use crate::error::{CompletionError, LookupError};

fn base(url: &str) -> anyhow::Result<Url> {
    let mut u = Url::parse(url)?;
    if !u.path().ends_with('/') {
        let path = format!("{}/", u.path());
        u.set_path(&path);
    }
    Ok(u)
}

#[derive(Clone)]
pub struct HttpBookLookup {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpBookLookup {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self { base_url: base(base_url)?, client: reqwest::Client::new() })
    }
}

#[async_trait]
impl EntityLookup for HttpBookLookup {
    async fn lookup(&self, id: &str) -> Result<Book, LookupError> {
        let id: i64 = id.trim().parse().map_err(|_| LookupError::NotFound)?;
        let url = self
            .base_url
            .join(&format!("api/books/{id}"))
            .map_err(|e| LookupError::Failed(e.to_string()))?;
        let resp = self.client.get(url).send().await.map_err(|e| LookupError::Failed(e.to_string()))?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(LookupError::NotFound);
        }
        if !status.is_success() {
            return Err(LookupError::Failed(format!("status {status}")));
        }
        resp.json::<Book>().await.map_err(|e| LookupError::Failed(e.to_string()))
    }
}

#[derive(Clone)]
pub struct HttpChatCompletion {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpChatCompletion {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self { endpoint: base(base_url)?.join("api/chat")?, client: reqwest::Client::new() })
    }
}

#[async_trait]
impl ChatCompletion for HttpChatCompletion {
    async fn complete(&self, req: CompletionRequest) -> Result<String, CompletionError> {
        let resp = self.client.post(self.endpoint.clone()).json(&req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CompletionError::Status(status.as_u16()));
        }
        let body: CompletionResponse = resp.json().await.map_err(|e| CompletionError::Malformed(e.to_string()))?;
        body.into_reply()
    }
}
