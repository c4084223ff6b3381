//! Client-visible error taxonomy.
//!
//! Screens only ever branch on a handful of kinds (login prompt for the auth
//! failures, a generic alert for everything else), so HTTP statuses collapse
//! into the variants below. Lower-level failures pass through unmodified.

use reqwest::StatusCode;
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
  /// The server rejected the request's authenticity token
  #[error("request rejected: invalid CSRF token")]
  Csrf,

  #[error("unauthorized")]
  Unauthorized,

  #[error("forbidden")]
  Forbidden,

  #[error("not found")]
  NotFound,

  /// The live socket dropped or was never connected
  #[error("socket disconnected")]
  Disconnected,

  /// Any other non-2xx response
  #[error("unexpected response ({status}): {body}")]
  Unexpected { status: u16, body: String },

  #[error("transport error: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("invalid JSON: {0}")]
  Json(#[from] serde_json::Error),

  #[error("socket error: {0}")]
  Socket(#[from] tokio_tungstenite::tungstenite::Error),

  #[error("store error: {0}")]
  Store(#[from] rusqlite::Error),

  #[error("invalid url: {0}")]
  Url(#[from] url::ParseError),
}

impl ApiError {
  /// Map a non-success status (and its body) to an error kind.
  ///
  /// Returns `None` for 2xx.
  pub fn from_status(status: StatusCode, body: &str) -> Option<Self> {
    if status.is_success() {
      return None;
    }

    let err = match status.as_u16() {
      401 => Self::Unauthorized,
      403 => Self::Forbidden,
      404 => Self::NotFound,
      422 if mentions_csrf(body) => Self::Csrf,
      code => Self::Unexpected {
        status: code,
        body: body.to_string(),
      },
    };
    Some(err)
  }

  /// True for the failures that should send the user back to sign-in.
  pub fn is_auth(&self) -> bool {
    matches!(self, Self::Unauthorized | Self::Forbidden | Self::Csrf)
  }
}

fn mentions_csrf(body: &str) -> bool {
  let body = body.to_lowercase();
  body.contains("csrf") || body.contains("authenticity token") || body.contains("authenticitytoken")
}
