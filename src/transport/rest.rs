use crate::board::items_order;
use crate::model::{Board, SyncConfig};
use crate::transport::TransportError;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

const CONTAINERS_PATH: &str = "api/containers";
const ITEMS_ORDER_PATH: &str = "api/containers-order-items";

/// REST client for the board backend. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl RestClient {
    pub fn new(cfg: &SyncConfig) -> Result<Self, TransportError> {
        let mut base_url =
            Url::parse(&cfg.base_url).map_err(|e| TransportError::InvalidUrl(format!("{}: {e}", cfg.base_url)))?;
        // Url::join drops the last path segment unless the base ends with '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            bearer_token: cfg.bearer_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path)
            .map_err(|e| TransportError::InvalidUrl(format!("{path}: {e}")))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer_token.as_deref() {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// `GET /api/containers`.
    pub async fn fetch_board(&self) -> Result<Board, TransportError> {
        let url = self.endpoint(CONTAINERS_PATH)?;
        tracing::debug!(%url, "fetching board");
        let resp = self.authorize(self.http.get(url)).send().await?;
        let body = read_success_body(resp).await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// `PATCH /api/containers-order-items` with the board's current item order.
    ///
    /// Returns the raw response text. Gives up with [`TransportError::Cancelled`]
    /// as soon as `cancel` fires.
    pub async fn update_items_order(
        &self,
        board: &Board,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::debug!("items order request aborted");
                Err(TransportError::Cancelled)
            }
            res = self.send_items_order(board) => res,
        }
    }

    async fn send_items_order(&self, board: &Board) -> Result<String, TransportError> {
        let url = self.endpoint(ITEMS_ORDER_PATH)?;
        let payload = items_order(board);
        tracing::debug!(%url, containers = payload.containers.len(), "sending items order");
        let resp = self
            .authorize(self.http.patch(url))
            .json(&payload)
            .send()
            .await?;
        read_success_body(resp).await
    }
}

async fn read_success_body(resp: reqwest::Response) -> Result<String, TransportError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(TransportError::Status { status, body });
    }
    Ok(body)
}
