use reqwest::StatusCode;

/// Non-success HTTP response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{method} {endpoint} returned {status}: {body}")]
pub struct HttpStatusError {
    pub method: &'static str,
    pub endpoint: String,
    pub status: StatusCode,
    pub body: String,
}

impl HttpStatusError {
    /// Rate limiting and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        self.status == StatusCode::TOO_MANY_REQUESTS || self.status.is_server_error()
    }
}

/// Longest response body kept in an error message.
const MAX_ERROR_BODY: usize = 500;

/// Turn a non-success response into an [`HttpStatusError`].
pub(crate) async fn check_status(
    response: reqwest::Response,
    method: &'static str,
    endpoint: &str,
) -> Result<reqwest::Response, HttpStatusError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let cut = (0..=MAX_ERROR_BODY)
            .rev()
            .find(|&i| body.is_char_boundary(i))
            .unwrap_or(0);
        body.truncate(cut);
    }
    Err(HttpStatusError {
        method,
        endpoint: endpoint.to_owned(),
        status,
        body,
    })
}
