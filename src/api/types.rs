//! Response envelope and collection-body helpers.

use reqwest::StatusCode;
use serde::de::{DeserializeOwned, Error as _};
use serde_json::Value;

use super::link::Links;

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
  pub status: StatusCode,
  /// Parsed JSON body; `None` when the server sent no content
  pub body: Option<Value>,
  pub links: Links,
}

impl ApiResponse {
  /// Deserialize the body into `T`. An empty body deserializes from `null`.
  pub fn json<T: DeserializeOwned>(self) -> serde_json::Result<T> {
    serde_json::from_value(self.body.unwrap_or(Value::Null))
  }
}

/// Pull the record list out of a collection page.
///
/// Pages are either a bare array or an object wrapping exactly one array
/// (`{"patients": [...]}`, possibly alongside scalar metadata).
pub fn page_records(body: Option<Value>) -> serde_json::Result<Vec<Value>> {
  match body {
    None | Some(Value::Null) => Ok(Vec::new()),
    Some(Value::Array(items)) => Ok(items),
    Some(Value::Object(map)) => {
      let mut arrays = map.into_iter().filter_map(|(_, v)| match v {
        Value::Array(items) => Some(items),
        _ => None,
      });
      match (arrays.next(), arrays.next()) {
        (Some(items), None) => Ok(items),
        (None, _) => Err(serde_json::Error::custom(
          "collection page has no record array",
        )),
        (Some(_), Some(_)) => Err(serde_json::Error::custom(
          "collection page has more than one record array",
        )),
      }
    }
    Some(_) => Err(serde_json::Error::custom(
      "collection page is not an array or object",
    )),
  }
}

/// Deserialize every record of a page.
pub fn decode_page<T: DeserializeOwned>(body: Option<Value>) -> serde_json::Result<Vec<T>> {
  page_records(body)?
    .into_iter()
    .map(serde_json::from_value)
    .collect()
}
