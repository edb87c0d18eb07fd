use futures::stream::{BoxStream, StreamExt};
use reqwest_streams::JsonStreamResponse;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use uuid::Uuid;

use crate::resources::ResourceView;
use crate::sync::StreamMessage;
use crate::tasks::{ChainReceipt, ChainView, SubmitTask, TaskReceipt, TaskView};

/// Upper bound for one line of the live stream.
const MAX_STREAM_LINE: usize = 16 * 1024 * 1024;


#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    #[error("server returned {status}: {message}")]
    Server { status: reqwest::StatusCode, message: String },

    #[error("live stream failed: {0}")]
    Stream(String),
}


#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}


#[derive(Clone, Debug)]
pub struct Client {
    reqwest: reqwest::Client,
    server: String,
}

impl Client {
    pub fn new(server: String) -> Self {
        Self {
            reqwest: reqwest::Client::new(),
            server: server.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.server, path)
    }

    pub async fn submit(&self, task: &SubmitTask) -> Result<Uuid, Error> {
        let response = self.reqwest
            .post(self.url("/tasks"))
            .json(task)
            .send()
            .await?;
        let receipt: TaskReceipt = json(response).await?;
        Ok(receipt.id)
    }

    pub async fn submit_chain(&self, tasks: &[SubmitTask]) -> Result<ChainReceipt, Error> {
        let response = self.reqwest
            .post(self.url("/chains"))
            .json(tasks)
            .send()
            .await?;
        json(response).await
    }

    pub async fn tasks(&self) -> Result<Vec<TaskView>, Error> {
        json(self.reqwest.get(self.url("/tasks")).send().await?).await
    }

    pub async fn task(&self, id: Uuid) -> Result<TaskView, Error> {
        json(self.reqwest.get(self.url(&format!("/tasks/{}", id))).send().await?).await
    }

    pub async fn stop(&self, id: Uuid) -> Result<TaskView, Error> {
        json(self.reqwest.post(self.url(&format!("/tasks/{}/stop", id))).send().await?).await
    }

    pub async fn chains(&self) -> Result<Vec<ChainView>, Error> {
        json(self.reqwest.get(self.url("/chains")).send().await?).await
    }

    pub async fn chain(&self, id: Uuid) -> Result<ChainView, Error> {
        json(self.reqwest.get(self.url(&format!("/chains/{}", id))).send().await?).await
    }

    pub async fn resources(&self) -> Result<Vec<ResourceView>, Error> {
        json(self.reqwest.get(self.url("/resources")).send().await?).await
    }

    pub async fn refresh_resources(&self) -> Result<Vec<ResourceView>, Error> {
        json(self.reqwest.post(self.url("/resources/refresh")).send().await?).await
    }

    /// The live stream: a snapshot followed by patches.
    pub async fn watch(&self) -> Result<BoxStream<'static, Result<StreamMessage, Error>>, Error> {
        let response = check(self.reqwest.get(self.url("/stream")).send().await?).await?;
        Ok(response
            .json_nl_stream::<StreamMessage>(MAX_STREAM_LINE)
            .map(|message| message.map_err(|err| Error::Stream(err.to_string())))
            .boxed())
    }
}


async fn check(response: reqwest::Response) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|body| body.error)
        .unwrap_or(body);
    Err(Error::Server { status, message })
}


async fn json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, Error> {
    Ok(check(response).await?.json().await?)
}
