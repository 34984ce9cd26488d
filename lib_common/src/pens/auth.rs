//! # Access Token Plumbing
//!
//! The sync layer never stores credentials. It asks a [`TokenSource`] for the
//! current token right before each call and refuses to touch the network when
//! there is none. [`login`] exchanges a username and password for a token
//! that the caller may then keep wherever it likes.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use super::coerce::{coerce_number, coerce_string};
use crate::retrieve::{ApiClient, ApiRequest, RequestBody, RetrieveError, Transport};

/// Token lifetime assumed when the login response does not state one.
pub const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(3600);

/// Yields the current valid access token, or `None` when signed out.
pub trait TokenSource: Send + Sync {
    /// The token to use for the next call.
    fn current_token(&self) -> Option<String>;
}

impl<F> TokenSource for F
where
    F: Fn() -> Option<String> + Send + Sync,
{
    fn current_token(&self) -> Option<String> {
        self()
    }
}

/// A fixed token, typically read from configuration.
#[derive(Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    /// Wraps `token`; an empty string counts as no token.
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self((!token.is_empty()).then_some(token))
    }

    /// A source that is always signed out.
    pub fn none() -> Self {
        Self(None)
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = if self.0.is_some() { "Some(<redacted>)" } else { "None" };
        f.debug_tuple("StaticToken").field(&format_args!("{}", shown)).finish()
    }
}

impl TokenSource for StaticToken {
    fn current_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// A successful login.
#[derive(Clone, PartialEq)]
pub struct LoginResponse {
    /// Bearer token for subsequent calls.
    pub access_token: String,
    /// Token type reported by the server, usually `bearer`.
    pub token_type: String,
    /// Lifetime of the token.
    pub expires_in: Duration,
}

impl fmt::Debug for LoginResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginResponse")
            .field("access_token", &"<redacted>")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl LoginResponse {
    /// Decodes a login body. A body without a token is treated as a rejected login.
    pub fn decode(payload: &Value) -> Result<Self, RetrieveError> {
        let access_token = coerce_string(payload.get("access_token"), "");
        if access_token.is_empty() {
            return Err(RetrieveError::Unauthenticated);
        }

        let default_secs = DEFAULT_EXPIRES_IN.as_secs_f64();
        let secs = coerce_number(payload.get("expires_in"), default_secs);
        let expires_in = Duration::try_from_secs_f64(secs).unwrap_or(DEFAULT_EXPIRES_IN);

        Ok(Self {
            access_token,
            token_type: coerce_string(payload.get("token_type"), "bearer"),
            expires_in,
        })
    }

    /// A token source yielding this login's token.
    pub fn token(&self) -> StaticToken {
        StaticToken::new(self.access_token.clone())
    }
}

/// Signs in with a form-encoded `POST <base>/auth/login`.
///
/// Login is a single attempt; a wrong password is not worth retrying.
pub async fn login<T: Transport>(
    client: &ApiClient<T>,
    username: &str,
    password: &str,
) -> Result<LoginResponse, RetrieveError> {
    let url = client.endpoint(&["auth", "login"])?;
    let form = RequestBody::Form(vec![
        ("username".to_string(), username.to_string()),
        ("password".to_string(), password.to_string()),
    ]);

    let body = client.send_once(&ApiRequest::post(url, form)).await?;
    let response = LoginResponse::decode(&body)?;
    log::info!("Signed in as {} (token valid {:?})", username, response.expires_in);
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieve::RetryPolicy;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct LoginServer {
        seen: Mutex<Vec<ApiRequest>>,
        reply: Mutex<Option<Result<Value, RetrieveError>>>,
    }

    impl Transport for LoginServer {
        async fn execute(&self, request: &ApiRequest) -> Result<Value, RetrieveError> {
            self.seen.lock().unwrap().push(request.clone());
            self.reply
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Err(RetrieveError::Transport("no reply".into())))
        }
    }

    fn client(reply: Result<Value, RetrieveError>) -> ApiClient<LoginServer> {
        let server = LoginServer::default();
        *server.reply.lock().unwrap() = Some(reply);
        ApiClient::with_transport("http://farm.test", server, RetryPolicy::default()).unwrap()
    }

    #[test]
    fn test_static_token() {
        assert_eq!(StaticToken::new("abc").current_token().as_deref(), Some("abc"));
        assert_eq!(StaticToken::new("").current_token(), None);
        assert_eq!(StaticToken::none().current_token(), None);
        assert!(!format!("{:?}", StaticToken::new("abc")).contains("abc"));
    }

    #[test]
    fn test_closure_token_source() {
        let source = || Some("from-closure".to_string());
        assert_eq!(source.current_token().as_deref(), Some("from-closure"));
    }

    #[test]
    fn test_login_response_defaults() {
        let resp = LoginResponse::decode(&json!({"access_token": "t"})).unwrap();
        assert_eq!(resp.expires_in, DEFAULT_EXPIRES_IN);
        assert_eq!(resp.token_type, "bearer");

        let resp = LoginResponse::decode(&json!({"access_token": "t", "expires_in": 60})).unwrap();
        assert_eq!(resp.expires_in, Duration::from_secs(60));

        let negative = LoginResponse::decode(&json!({"access_token": "t", "expires_in": -5})).unwrap();
        assert_eq!(negative.expires_in, DEFAULT_EXPIRES_IN);

        assert!(matches!(
            LoginResponse::decode(&json!({"token_type": "bearer"})),
            Err(RetrieveError::Unauthenticated)
        ));
    }

    #[tokio::test]
    async fn test_login_posts_form_once() {
        let api = client(Ok(json!({"access_token": "tok", "token_type": "bearer"})));

        let resp = login(&api, "farmer", "hunter2").await.unwrap();
        assert_eq!(resp.token().current_token().as_deref(), Some("tok"));

        let seen = api_requests(&api);
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, reqwest::Method::POST);
        assert_eq!(seen[0].url.as_str(), "http://farm.test/auth/login");
        assert_eq!(
            seen[0].body,
            Some(RequestBody::Form(vec![
                ("username".into(), "farmer".into()),
                ("password".into(), "hunter2".into()),
            ]))
        );
    }

    #[tokio::test]
    async fn test_rejected_login_is_not_retried() {
        let api = client(Err(RetrieveError::Status { status: 401, body: None }));
        let err = login(&api, "farmer", "wrong").await.unwrap_err();
        assert!(matches!(err, RetrieveError::Status { status: 401, .. }));
        assert_eq!(api_requests(&api).len(), 1);
    }

    fn api_requests(api: &ApiClient<LoginServer>) -> Vec<ApiRequest> {
        api.transport().seen.lock().unwrap().clone()
    }
}
