//! `Link` response header parsing for paginated collections.

use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

fn link_pattern() -> &'static Regex {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  PATTERN.get_or_init(|| {
    Regex::new(r#"<([^>]*)>\s*;\s*rel="([^"]*)""#).expect("link header pattern is valid")
  })
}

/// Relations extracted from a `Link` header, keyed by `rel`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Links {
  rels: HashMap<String, String>,
}

impl Links {
  pub fn get(&self, rel: &str) -> Option<&str> {
    self.rels.get(rel).map(String::as_str)
  }

  pub fn next(&self) -> Option<&str> {
    self.get("next")
  }

  pub fn prev(&self) -> Option<&str> {
    self.get("prev")
  }

  pub fn first(&self) -> Option<&str> {
    self.get("first")
  }

  pub fn last(&self) -> Option<&str> {
    self.get("last")
  }

  pub fn is_empty(&self) -> bool {
    self.rels.is_empty()
  }

  pub fn len(&self) -> usize {
    self.rels.len()
  }
}

/// Extract every `<url>; rel="type"` pair. Later duplicates win, malformed
/// segments are skipped.
pub fn parse_link_header(header: &str) -> Links {
  let rels = link_pattern()
    .captures_iter(header)
    .map(|caps| (caps[2].to_string(), caps[1].to_string()))
    .collect();

  Links { rels }
}
