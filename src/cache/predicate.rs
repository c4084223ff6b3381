//! Query predicates and sort descriptors over the JSON form of entities.
//!
//! Fields are addressed by dot-separated key paths (`"transport.facility_id"`).
//! A missing field behaves like `null`.

use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum Predicate {
  /// Matches everything
  #[default]
  All,
  Eq(String, Value),
  Ne(String, Value),
  IsNull(String),
  /// Case-insensitive substring match
  Contains(String, String),
  /// Case-insensitive prefix match
  BeginsWith(String, String),
  In(String, Vec<Value>),
  And(Vec<Predicate>),
  Or(Vec<Predicate>),
  Not(Box<Predicate>),
}

impl Predicate {
  pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::Eq(path.into(), value.into())
  }

  pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
    Self::Ne(path.into(), value.into())
  }

  pub fn is_null(path: impl Into<String>) -> Self {
    Self::IsNull(path.into())
  }

  pub fn contains(path: impl Into<String>, needle: impl Into<String>) -> Self {
    Self::Contains(path.into(), needle.into())
  }

  pub fn begins_with(path: impl Into<String>, prefix: impl Into<String>) -> Self {
    Self::BeginsWith(path.into(), prefix.into())
  }

  pub fn is_in(path: impl Into<String>, values: Vec<Value>) -> Self {
    Self::In(path.into(), values)
  }

  pub fn negate(self) -> Self {
    Self::Not(Box::new(self))
  }

  /// Conjunction, flattening `All` away.
  pub fn and(self, other: Predicate) -> Self {
    match (self, other) {
      (Predicate::All, p) | (p, Predicate::All) => p,
      (Predicate::And(mut left), Predicate::And(right)) => {
        left.extend(right);
        Predicate::And(left)
      }
      (Predicate::And(mut left), p) => {
        left.push(p);
        Predicate::And(left)
      }
      (p, q) => Predicate::And(vec![p, q]),
    }
  }

  pub fn matches(&self, record: &Value) -> bool {
    match self {
      Predicate::All => true,
      Predicate::Eq(path, expected) => values_equal(lookup(record, path), expected),
      Predicate::Ne(path, expected) => !values_equal(lookup(record, path), expected),
      Predicate::IsNull(path) => matches!(lookup(record, path), None | Some(Value::Null)),
      Predicate::Contains(path, needle) => text_of(lookup(record, path))
        .map(|text| text.to_lowercase().contains(&needle.to_lowercase()))
        .unwrap_or(false),
      Predicate::BeginsWith(path, prefix) => text_of(lookup(record, path))
        .map(|text| text.to_lowercase().starts_with(&prefix.to_lowercase()))
        .unwrap_or(false),
      Predicate::In(path, options) => {
        let actual = lookup(record, path);
        options.iter().any(|option| values_equal(actual, option))
      }
      Predicate::And(parts) => parts.iter().all(|p| p.matches(record)),
      Predicate::Or(parts) => parts.iter().any(|p| p.matches(record)),
      Predicate::Not(inner) => !inner.matches(record),
    }
  }
}

/// Search-bar predicate: every whitespace-separated term must appear in at
/// least one of `fields`.
pub fn search(fields: &[&str], text: &str) -> Predicate {
  let terms: Vec<Predicate> = text
    .split_whitespace()
    .map(|term| {
      Predicate::Or(
        fields
          .iter()
          .map(|field| Predicate::contains(*field, term))
          .collect(),
      )
    })
    .collect();

  match terms.len() {
    0 => Predicate::All,
    1 => terms.into_iter().next().unwrap_or_default(),
    _ => Predicate::And(terms),
  }
}

/// Resolve a dot-separated key path.
pub fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
  path.split('.').try_fold(record, |current, segment| match current {
    Value::Object(map) => map.get(segment),
    Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
    _ => None,
  })
}

fn text_of(value: Option<&Value>) -> Option<String> {
  match value? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

fn values_equal(actual: Option<&Value>, expected: &Value) -> bool {
  match (actual, expected) {
    (None, Value::Null) => true,
    (None, _) => false,
    (Some(Value::Number(a)), Value::Number(b)) => a.as_f64() == b.as_f64(),
    (Some(a), b) => a == b,
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortDescriptor {
  pub key_path: String,
  pub ascending: bool,
}

impl SortDescriptor {
  pub fn asc(key_path: impl Into<String>) -> Self {
    Self {
      key_path: key_path.into(),
      ascending: true,
    }
  }

  pub fn desc(key_path: impl Into<String>) -> Self {
    Self {
      key_path: key_path.into(),
      ascending: false,
    }
  }
}

/// Predicate plus ordering, the shape of a store query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
  pub predicate: Predicate,
  pub sort: Vec<SortDescriptor>,
}

impl Filter {
  pub fn new(predicate: Predicate) -> Self {
    Self {
      predicate,
      sort: Vec::new(),
    }
  }

  pub fn sorted_by(mut self, descriptor: SortDescriptor) -> Self {
    self.sort.push(descriptor);
    self
  }

  /// Order `(key, record)` pairs by the descriptors, then by key.
  pub fn sort_records(&self, records: &mut [(String, Value)]) {
    records.sort_by(|(key_a, a), (key_b, b)| {
      self
        .sort
        .iter()
        .map(|d| {
          let ord = compare_values(lookup(a, &d.key_path), lookup(b, &d.key_path));
          if d.ascending {
            ord
          } else {
            ord.reverse()
          }
        })
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or_else(|| key_a.cmp(key_b))
    });
  }
}

fn type_rank(value: Option<&Value>) -> u8 {
  match value {
    None | Some(Value::Null) => 0,
    Some(Value::Bool(_)) => 1,
    Some(Value::Number(_)) => 2,
    Some(Value::String(_)) => 3,
    Some(_) => 4,
  }
}

/// Total order used for sorting: null < bool < number < string < other.
/// Strings compare case-insensitively.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  match (a, b) {
    (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
    (Some(Value::Number(x)), Some(Value::Number(y))) => {
      let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Some(Value::String(x)), Some(Value::String(y))) => x.to_lowercase().cmp(&y.to_lowercase()),
    (Some(x @ (Value::Array(_) | Value::Object(_))), Some(y @ (Value::Array(_) | Value::Object(_)))) => {
      x.to_string().cmp(&y.to_string())
    }
    _ => type_rank(a).cmp(&type_rank(b)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record() -> Value {
    json!({
      "id": "p1",
      "first_name": "Ada",
      "last_name": "Lovelace",
      "age": 36,
      "priority": "immediate",
      "transported_at": null,
      "transport": {"facility_id": "f9"}
    })
  }

  #[test]
  fn test_basic_predicates() {
    let r = record();
    assert!(Predicate::All.matches(&r));
    assert!(Predicate::eq("priority", "immediate").matches(&r));
    assert!(Predicate::eq("age", 36.0).matches(&r));
    assert!(Predicate::ne("priority", "dead").matches(&r));
    assert!(Predicate::is_null("transported_at").matches(&r));
    assert!(Predicate::is_null("no_such_field").matches(&r));
    assert!(Predicate::eq("no_such_field", Value::Null).matches(&r));
    assert!(Predicate::eq("transport.facility_id", "f9").matches(&r));
    assert!(!Predicate::eq("transport.facility_id.deeper", "f9").matches(&r));
  }

  #[test]
  fn test_string_predicates_ignore_case() {
    let r = record();
    assert!(Predicate::contains("last_name", "LOVE").matches(&r));
    assert!(Predicate::contains("age", "3").matches(&r));
    assert!(!Predicate::contains("missing", "x").matches(&r));
    assert!(Predicate::begins_with("first_name", "ad").matches(&r));
    assert!(!Predicate::begins_with("first_name", "da").matches(&r));
  }

  #[test]
  fn test_compound_predicates() {
    let r = record();
    let p = Predicate::eq("priority", "immediate").and(Predicate::contains("first_name", "ada"));
    assert!(p.matches(&r));
    assert!(matches!(p, Predicate::And(ref parts) if parts.len() == 2));
    assert_eq!(Predicate::All.and(Predicate::is_null("x")), Predicate::is_null("x"));
    assert!(!p.clone().negate().matches(&r));
    assert!(Predicate::Or(vec![Predicate::eq("age", 1), Predicate::eq("age", 36)]).matches(&r));
    assert!(Predicate::is_in("priority", vec![json!("delayed"), json!("immediate")]).matches(&r));
  }

  #[test]
  fn test_search_terms() {
    let r = record();
    assert_eq!(search(&["first_name"], "   "), Predicate::All);
    assert!(search(&["first_name", "last_name"], "ada love").matches(&r));
    assert!(!search(&["first_name", "last_name"], "ada byron").matches(&r));
  }

  #[test]
  fn test_sorting_with_tiebreak() {
    let mut rows = vec![
      ("c".to_string(), json!({"name": "beta", "age": 2})),
      ("a".to_string(), json!({"name": "Alpha", "age": 2})),
      ("b".to_string(), json!({"name": null, "age": 9})),
      ("d".to_string(), json!({"name": "alpha", "age": 2})),
    ];

    Filter::default()
      .sorted_by(SortDescriptor::asc("name"))
      .sort_records(&mut rows);
    let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["b", "a", "d", "c"]);

    Filter::default()
      .sorted_by(SortDescriptor::desc("age"))
      .sort_records(&mut rows);
    let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["b", "a", "c", "d"]);
  }

  #[test]
  fn test_case_only_difference_falls_through_to_next_descriptor() {
    let mut rows = vec![
      ("k1".to_string(), json!({"name": "Alpha", "age": 9})),
      ("k2".to_string(), json!({"name": "alpha", "age": 1})),
    ];

    Filter::default()
      .sorted_by(SortDescriptor::asc("name"))
      .sorted_by(SortDescriptor::asc("age"))
      .sort_records(&mut rows);
    let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["k2", "k1"]);
    assert_eq!(
      compare_values(Some(&json!("ALPHA")), Some(&json!("alpha"))),
      Ordering::Equal
    );
  }
}
