use anyhow::{Context, Result, ensure};
use reqwest::blocking::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Create the blocking client used for the hardware daemon.
///
/// Must be called outside of an async context, e.g. from
/// `tokio::task::spawn_blocking`.
pub fn device_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to create device service HTTP client")
}

/// Handle HTTP response by checking status and extracting body
///
/// # Arguments
/// * `res` - The HTTP response to handle
/// * `context_msg` - Context message describing the request (e.g., "GET /wifi/status/v1")
///
/// # Returns
/// * `Ok(String)` - The response body if the status is successful
/// * `Err` - If the status is not successful or reading the body fails
pub fn handle_http_response(res: Response, context_msg: &str) -> Result<String> {
    let status = res.status();
    let body = res.text().context("failed to read response body")?;

    ensure!(
        status.is_success(),
        "{context_msg} failed with status {status} and body: {body}"
    );

    Ok(body)
}

/// Parse a JSON response body, naming the request in the error.
pub fn parse_json_body<T: DeserializeOwned>(body: &str, context_msg: &str) -> Result<T> {
    serde_json::from_str(body).context(format!("failed to parse {context_msg} response"))
}
