use anyhow::{Result, bail};
use lib_common::pens::{PenApi, StaticToken, login};
use lib_common::retrieve::{ApiClient, Transport};
use std::sync::Arc;

use super::config::Settings;

/// The configured token, or a fresh one from signing in.
pub async fn resolve_token<T: Transport>(settings: &Settings, client: &ApiClient<T>) -> Result<StaticToken> {
    if let Some(token) = &settings.access_token {
        log::info!("Using configured access token");
        return Ok(StaticToken::new(token.clone()));
    }

    match (&settings.username, &settings.password) {
        (Some(username), Some(password)) => {
            let response = login(client, username, password).await?;
            Ok(response.token())
        }
        _ => bail!("No credentials: set PEN_ACCESS_TOKEN, or PEN_USERNAME and PEN_PASSWORD"),
    }
}

/// Builds the pen client for the resolved settings, signing in when needed.
pub async fn connect(settings: &Settings) -> Result<Arc<PenApi<StaticToken>>> {
    let client = ApiClient::new(&settings.api_base_url, settings.retry.clone())?;
    let token = resolve_token(settings, &client).await?;
    let api = PenApi::new(client, &settings.ws_base_url, token)?.with_reconnect_policy(settings.reconnect);
    Ok(Arc::new(api))
}
