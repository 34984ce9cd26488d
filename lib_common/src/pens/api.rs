//! # Pen Endpoints
//!
//! Binds the generic retrieval and streaming layers to the pen backend:
//! `GET /pens`, `GET /pens/{id}/detail`, and the `/ws/pens` push channels.
//! The bearer token is read from the [`TokenSource`] for every call.

use tokio_util::sync::CancellationToken;
use url::Url;

use super::auth::TokenSource;
use super::model::{decode_piggeries, Piggery};
use super::timeseries::{decode_time_series, PointSample};
use crate::ingestors::ReconnectPolicy;
use crate::retrieve::{join_segments, ApiClient, ApiRequest, ReqwestTransport, RetrieveError, Transport};

/// Client for the pen backend.
pub struct PenApi<S, T = ReqwestTransport> {
    client: ApiClient<T>,
    ws_base: Url,
    tokens: S,
    reconnect: ReconnectPolicy,
}

impl<S: TokenSource, T: Transport> PenApi<S, T> {
    /// Combines an HTTP client, the push-channel base URL and a token source.
    pub fn new(client: ApiClient<T>, ws_base_url: &str, tokens: S) -> Result<Self, RetrieveError> {
        Ok(Self {
            client,
            ws_base: Url::parse(ws_base_url)?,
            tokens,
            reconnect: ReconnectPolicy::default(),
        })
    }

    /// Overrides the reconnect schedule used by streams opened from this client.
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Reconnect schedule for this client's streams.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        self.reconnect
    }

    /// The underlying HTTP client.
    pub fn client(&self) -> &ApiClient<T> {
        &self.client
    }

    fn token(&self) -> Result<String, RetrieveError> {
        self.tokens
            .current_token()
            .filter(|token| !token.is_empty())
            .ok_or(RetrieveError::Unauthenticated)
    }

    async fn get_json(
        &self,
        segments: &[&str],
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, RetrieveError> {
        let token = self.token()?;
        let request = ApiRequest::get(self.client.endpoint(segments)?).bearer(&token)?;
        self.client.request_with_retry(&request, cancel).await
    }

    /// Fetches the pen list snapshot.
    pub async fn fetch_pens(&self, cancel: &CancellationToken) -> Result<Vec<Piggery>, RetrieveError> {
        let body = self.get_json(&["pens"], cancel).await?;
        let piggeries = decode_piggeries(&body);
        log::debug!("Fetched {} piggeries", piggeries.len());
        Ok(piggeries)
    }

    /// Fetches the time-series snapshot of one pen, oldest first.
    pub async fn fetch_pen_detail(
        &self,
        pen_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<PointSample>, RetrieveError> {
        let body = self.get_json(&["pens", pen_id, "detail"], cancel).await?;
        let samples = decode_time_series(&body);
        log::debug!("Fetched {} points for pen {}", samples.len(), pen_id);
        Ok(samples)
    }

    fn stream_url(&self, segments: &[&str]) -> Result<String, RetrieveError> {
        let token = self.token()?;
        let mut url = join_segments(&self.ws_base, segments)?;
        url.query_pairs_mut().clear().append_pair("token", &token);
        Ok(url.into())
    }

    /// URL of the pen list push channel, token included.
    pub fn pens_stream_url(&self) -> Result<String, RetrieveError> {
        self.stream_url(&["ws", "pens"])
    }

    /// URL of one pen's push channel, token included.
    pub fn pen_stream_url(&self, pen_id: &str) -> Result<String, RetrieveError> {
        self.stream_url(&["ws", "pens", pen_id])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pens::auth::StaticToken;
    use crate::retrieve::RetryPolicy;
    use reqwest::header::AUTHORIZATION;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Backend {
        seen: Mutex<Vec<ApiRequest>>,
    }

    impl Transport for Backend {
        async fn execute(&self, request: &ApiRequest) -> Result<Value, RetrieveError> {
            self.seen.lock().unwrap().push(request.clone());
            match request.url.path() {
                "/pens" => Ok(json!({"piggeies": [{"piggery_id": "A", "pens": []}]})),
                "/pens/3/detail" => Ok(json!({"time_series": [{"activity": 1, "feeding_time": 2}]})),
                _ => Err(RetrieveError::Status { status: 404, body: None }),
            }
        }
    }

    fn api(token: StaticToken) -> PenApi<StaticToken, Backend> {
        let client =
            ApiClient::with_transport("http://farm.test", Backend::default(), RetryPolicy::default())
                .unwrap();
        PenApi::new(client, "ws://farm.test", token).unwrap()
    }

    #[tokio::test]
    async fn test_fetches_send_bearer_token() {
        let api = api(StaticToken::new("tok"));
        let cancel = CancellationToken::new();

        let piggeries = api.fetch_pens(&cancel).await.unwrap();
        assert_eq!(piggeries[0].piggery_id, "A");

        let samples = api.fetch_pen_detail("3", &cancel).await.unwrap();
        assert_eq!(samples, vec![PointSample { activity: 1.0, feeding_time: 2.0 }]);

        let seen = api.client().transport().seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.headers.get(AUTHORIZATION).unwrap() == "Bearer tok"));
    }

    #[tokio::test]
    async fn test_no_token_means_no_request() {
        let api = api(StaticToken::none());
        let err = api.fetch_pens(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, RetrieveError::Unauthenticated));
        assert!(api.client().transport().seen.lock().unwrap().is_empty());
        assert!(matches!(api.pens_stream_url(), Err(RetrieveError::Unauthenticated)));
    }

    #[test]
    fn test_stream_urls_carry_encoded_token() {
        let api = api(StaticToken::new("a b&c"));
        assert_eq!(api.pens_stream_url().unwrap(), "ws://farm.test/ws/pens?token=a+b%26c");
        assert_eq!(api.pen_stream_url("3").unwrap(), "ws://farm.test/ws/pens/3?token=a+b%26c");
    }
}
