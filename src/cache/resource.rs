//! Keys for fetched REST resources.

use sha2::{Digest, Sha256};

/// A REST collection path plus its query, identifying one cached result.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resource {
  pub path: String,
  pub query: Vec<(String, String)>,
}

impl Resource {
  pub fn new(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      query: Vec::new(),
    }
  }

  pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.query.push((name.into(), value.into()));
    self
  }

  /// Query pairs in the shape the client takes.
  pub fn query_pairs(&self) -> Vec<(&str, &str)> {
    self
      .query
      .iter()
      .map(|(k, v)| (k.as_str(), v.as_str()))
      .collect()
  }

  /// Stable key for the store: parameter order and trailing slashes don't
  /// change the identity of a resource.
  pub fn cache_hash(&self) -> String {
    let mut params = self.query_pairs();
    params.sort();

    // Length-prefix every part so separators inside values can't collide
    let mut hasher = Sha256::new();
    let path = normalize_path(&self.path);
    let parts = std::iter::once(path.as_str()).chain(params.iter().flat_map(|(k, v)| [*k, *v]));
    for part in parts {
      hasher.update((part.len() as u64).to_le_bytes());
      hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
  }

  pub fn description(&self) -> String {
    if self.query.is_empty() {
      self.path.clone()
    } else {
      let params: Vec<String> = self
        .query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
      format!("{}?{}", self.path, params.join("&"))
    }
  }
}

fn normalize_path(path: &str) -> String {
  let trimmed = path.trim().trim_end_matches('/');
  if trimmed.starts_with('/') {
    trimmed.to_string()
  } else {
    format!("/{}", trimmed)
  }
}
