use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use url::{Position, Url};

use crate::config::ServerConfig;
use crate::error::{ApiError, ApiResult};

use super::link::parse_link_header;
use super::types::{decode_page, ApiResponse};

/// Header naming the active tenant.
pub const SUBDOMAIN_HEADER: &str = "X-Agency-Subdomain";

/// Upper bound on pages followed by `get_all`, guards against link cycles.
const MAX_PAGES: usize = 500;

/// REST client for the triage backend
#[derive(Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
  subdomain: String,
  token: Option<String>,
}

impl ApiClient {
  pub fn new(server: &ServerConfig, token: Option<String>) -> ApiResult<Self> {
    let base = Url::parse(&server.url)?;
    let http = reqwest::Client::builder().build()?;

    Ok(Self {
      http,
      base,
      subdomain: server.subdomain.clone(),
      token,
    })
  }

  pub fn base_url(&self) -> &Url {
    &self.base
  }

  pub fn subdomain(&self) -> &str {
    &self.subdomain
  }

  /// Resolve a path (or an absolute URL taken from a `Link` header).
  fn url(&self, path: &str) -> ApiResult<Url> {
    Ok(self.base.join(path)?)
  }

  /// Headers carried by every request, the socket handshake included.
  pub(crate) fn headers(&self) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    if let Ok(value) = HeaderValue::from_str(&self.subdomain) {
      headers.insert(SUBDOMAIN_HEADER, value);
    }
    if let Some(token) = &self.token {
      if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
        headers.insert(AUTHORIZATION, value);
      }
    }
    headers
  }

  async fn send(
    &self,
    method: Method,
    url: Url,
    query: &[(&str, &str)],
    body: Option<&Value>,
  ) -> ApiResult<ApiResponse> {
    let mut request = self
      .http
      .request(method.clone(), url.clone())
      .headers(self.headers());
    if !query.is_empty() {
      request = request.query(query);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request.send().await?;
    let status = response.status();
    debug!(%method, path = url.path(), status = status.as_u16(), "api request");

    let links = response
      .headers()
      .get(LINK)
      .and_then(|v| v.to_str().ok())
      .map(parse_link_header)
      .unwrap_or_default();
    let text = response.text().await?;

    if let Some(err) = ApiError::from_status(status, &text) {
      warn!(%method, path = url.path(), status = status.as_u16(), "api request failed");
      return Err(err);
    }

    let body = if text.trim().is_empty() {
      None
    } else {
      Some(serde_json::from_str(&text)?)
    };

    Ok(ApiResponse {
      status,
      body,
      links,
    })
  }

  pub async fn get(&self, path: &str, query: &[(&str, &str)]) -> ApiResult<ApiResponse> {
    self.send(Method::GET, self.url(path)?, query, None).await
  }

  pub async fn post(&self, path: &str, body: &Value) -> ApiResult<ApiResponse> {
    self.send(Method::POST, self.url(path)?, &[], Some(body)).await
  }

  pub async fn patch(&self, path: &str, body: &Value) -> ApiResult<ApiResponse> {
    self.send(Method::PATCH, self.url(path)?, &[], Some(body)).await
  }

  pub async fn delete(&self, path: &str) -> ApiResult<ApiResponse> {
    self.send(Method::DELETE, self.url(path)?, &[], None).await
  }

  /// GET a single JSON document.
  pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<T> {
    Ok(self.get(path, &[]).await?.json()?)
  }

  /// GET a collection, following `rel="next"` links until none is left.
  ///
  /// The query only applies to the first page; `next` URLs carry their own.
  pub async fn get_all<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, &str)],
  ) -> ApiResult<Vec<T>> {
    self.get_pages(path, query, MAX_PAGES).await
  }

  async fn get_pages<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, &str)],
    max_pages: usize,
  ) -> ApiResult<Vec<T>> {
    let mut all = Vec::new();
    let mut response = self.get(path, query).await?;
    let mut pages = 1;

    loop {
      let next = response.links.next().map(String::from);
      all.extend(decode_page::<T>(response.body)?);

      let next = match next {
        Some(next) => next,
        None => return Ok(all),
      };
      if pages >= max_pages {
        warn!(path, pages, "pagination limit reached");
        return Ok(all);
      }

      response = self
        .send(Method::GET, self.url(&next)?, &[], None)
        .await?;
      pages += 1;
    }
  }

  /// WebSocket URL on the same host: http becomes ws, https becomes wss.
  pub fn socket_url(&self, path: &str, query: &[(&str, &str)]) -> ApiResult<Url> {
    let http_url = self.url(path)?;
    let scheme = match http_url.scheme() {
      "https" => "wss",
      "http" => "ws",
      other => other,
    };

    let mut url = Url::parse(&format!("{}{}", scheme, &http_url[Position::AfterScheme..]))?;
    if !query.is_empty() {
      url.query_pairs_mut().extend_pairs(query);
    }
    Ok(url)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::test_server::{http_response, TestServer};
  use serde::Deserialize;
  use serde_json::json;

  fn client_for(url: &str, token: Option<&str>) -> ApiClient {
    let server = ServerConfig {
      url: url.to_string(),
      subdomain: "metro".to_string(),
      socket_path: "/cable".to_string(),
    };
    ApiClient::new(&server, token.map(String::from)).unwrap()
  }

  #[derive(Debug, Deserialize, PartialEq)]
  struct Row {
    id: String,
  }

  #[tokio::test]
  async fn test_headers_and_body() {
    let server = TestServer::bind().await;
    let url = server.url();
    let requests = server.serve(vec![http_response(200, &[], r#"{"id":"7"}"#)]);

    let client = client_for(&url, Some("secret"));
    let row: Row = client.get_json("/api/patients/7").await.unwrap();
    assert_eq!(row, Row { id: "7".into() });

    let seen = requests.await.unwrap();
    let head = seen[0].to_lowercase();
    assert!(head.starts_with("get /api/patients/7 "));
    assert!(head.contains("x-agency-subdomain: metro"));
    assert!(head.contains("authorization: bearer secret"));
    assert!(head.contains("accept: application/json"));
  }

  #[tokio::test]
  async fn test_no_token_sends_no_authorization() {
    let server = TestServer::bind().await;
    let url = server.url();
    let requests = server.serve(vec![http_response(204, &[], "")]);

    let client = client_for(&url, None);
    let response = client.delete("/api/pins/1").await.unwrap();
    assert!(response.body.is_none());

    let seen = requests.await.unwrap();
    assert!(!seen[0].to_lowercase().contains("authorization:"));
  }

  #[tokio::test]
  async fn test_status_errors_are_mapped() {
    let server = TestServer::bind().await;
    let url = server.url();
    let _requests = server.serve(vec![
      http_response(401, &[], ""),
      http_response(404, &[], r#"{"error":"missing"}"#),
      http_response(503, &[], "down"),
    ]);

    let client = client_for(&url, None);
    assert!(matches!(
      client.get("/api/scenes", &[]).await,
      Err(ApiError::Unauthorized)
    ));
    assert!(matches!(
      client.get("/api/scenes/9", &[]).await,
      Err(ApiError::NotFound)
    ));
    assert!(matches!(
      client.get("/api/scenes", &[]).await,
      Err(ApiError::Unexpected { status: 503, .. })
    ));
  }

  #[tokio::test]
  async fn test_post_sends_json() {
    let server = TestServer::bind().await;
    let url = server.url();
    let requests = server.serve(vec![http_response(201, &[], r#"{"id":"new"}"#)]);

    let client = client_for(&url, None);
    let response = client
      .post("/api/patients", &json!({"first_name": "Ada"}))
      .await
      .unwrap();
    assert_eq!(response.status.as_u16(), 201);

    let seen = requests.await.unwrap();
    assert!(seen[0].starts_with("POST /api/patients "));
    assert!(seen[0].ends_with(r#"{"first_name":"Ada"}"#));
  }

  #[tokio::test]
  async fn test_get_all_follows_next_links() {
    let server = TestServer::bind().await;
    let url = server.url();
    let page2 = format!("{}/api/patients?page=2", url);
    let link = format!(r#"<{}>; rel="next""#, page2);
    let requests = server.serve(vec![
      http_response(200, &[("Link", &link)], r#"{"patients":[{"id":"1"},{"id":"2"}]}"#),
      http_response(200, &[], r#"[{"id":"3"}]"#),
    ]);

    let client = client_for(&url, None);
    let rows: Vec<Row> = client
      .get_all("/api/patients", &[("scene_id", "4")])
      .await
      .unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);

    let seen = requests.await.unwrap();
    assert!(seen[0].starts_with("GET /api/patients?scene_id=4 "));
    assert!(seen[1].starts_with("GET /api/patients?page=2 "));
  }

  #[tokio::test]
  async fn test_pagination_stops_at_page_limit() {
    let server = TestServer::bind().await;
    let url = server.url();
    // Every page links to another one
    let link = format!(r#"<{}/api/patients?page=next>; rel="next""#, url);
    let requests = server.serve(
      (1..=3)
        .map(|i| http_response(200, &[("Link", &link)], &format!(r#"[{{"id":"{}"}}]"#, i)))
        .collect(),
    );

    let client = client_for(&url, None);
    let rows: Vec<Row> = client.get_pages("/api/patients", &[], 3).await.unwrap();
    let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert_eq!(requests.await.unwrap().len(), 3);
  }

  #[test]
  fn test_socket_url_swaps_scheme() {
    let client = client_for("https://api.example.org", None);
    assert_eq!(
      client.socket_url("/cable", &[]).unwrap().as_str(),
      "wss://api.example.org/cable"
    );

    let client = client_for("http://localhost:3000", None);
    assert_eq!(
      client
        .socket_url("/cable", &[("scene_id", "12")])
        .unwrap()
        .as_str(),
      "ws://localhost:3000/cable?scene_id=12"
    );
  }
}
