//! Entities mirrored from the server.
//!
//! These are plain records persisted verbatim into the local store. The
//! server owns identity; the client never invents ids or versions.

mod cache;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agency {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub subdomain: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Facility {
  pub id: String,
  pub name: String,
  /// Hospital, trauma center, burn unit, ...
  #[serde(default)]
  pub kind: Option<String>,
  #[serde(default)]
  pub address: Option<String>,
  #[serde(default)]
  pub lat: Option<f64>,
  #[serde(default)]
  pub lng: Option<f64>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// A mass-casualty incident location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub address: Option<String>,
  #[serde(default)]
  pub lat: Option<f64>,
  #[serde(default)]
  pub lng: Option<f64>,
  #[serde(default)]
  pub is_active: bool,
  #[serde(default)]
  pub is_mci: bool,
  #[serde(default)]
  pub closed_at: Option<String>,
  #[serde(default)]
  pub incident_commander_id: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// A unit or person assigned to a scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Responder {
  pub id: String,
  pub scene_id: String,
  #[serde(default)]
  pub agency_id: Option<String>,
  #[serde(default)]
  pub user_id: Option<String>,
  #[serde(default)]
  pub vehicle: Option<String>,
  #[serde(default)]
  pub role: Option<String>,
  #[serde(default)]
  pub capability: Option<String>,
  #[serde(default)]
  pub arrived_at: Option<String>,
  #[serde(default)]
  pub departed_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

/// Triage record for one patient
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patient {
  pub id: String,
  /// Number on the physical triage tag
  #[serde(default)]
  pub pin: Option<String>,
  #[serde(default)]
  pub scene_id: Option<String>,
  #[serde(default)]
  pub first_name: Option<String>,
  #[serde(default)]
  pub last_name: Option<String>,
  #[serde(default)]
  pub age: Option<u32>,
  #[serde(default)]
  pub gender: Option<String>,
  #[serde(default)]
  pub priority: Priority,
  #[serde(default)]
  pub location: Option<String>,
  #[serde(default)]
  pub transport_facility_id: Option<String>,
  #[serde(default)]
  pub transport_agency_id: Option<String>,
  #[serde(default)]
  pub transported_at: Option<String>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

impl Patient {
  pub fn is_transported(&self) -> bool {
    self.transported_at.is_some()
  }

  pub fn full_name(&self) -> String {
    [self.first_name.as_deref(), self.last_name.as_deref()]
      .into_iter()
      .flatten()
      .filter(|s| !s.is_empty())
      .collect::<Vec<_>>()
      .join(" ")
  }
}

/// START triage category.
///
/// Unrecognized strings from the server land in `Unknown` rather than
/// failing the whole record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
  Immediate,
  Delayed,
  Minimal,
  Expectant,
  Dead,
  #[default]
  Unknown,
}

impl Priority {
  pub const ALL: [Priority; 6] = [
    Priority::Immediate,
    Priority::Delayed,
    Priority::Minimal,
    Priority::Expectant,
    Priority::Dead,
    Priority::Unknown,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Priority::Immediate => "immediate",
      Priority::Delayed => "delayed",
      Priority::Minimal => "minimal",
      Priority::Expectant => "expectant",
      Priority::Dead => "dead",
      Priority::Unknown => "unknown",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s.trim().to_ascii_lowercase().as_str() {
      "immediate" | "red" => Priority::Immediate,
      "delayed" | "yellow" => Priority::Delayed,
      "minimal" | "minor" | "green" => Priority::Minimal,
      "expectant" | "gray" | "grey" => Priority::Expectant,
      "dead" | "black" => Priority::Dead,
      _ => Priority::Unknown,
    }
  }
}

impl fmt::Display for Priority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

impl Serialize for Priority {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for Priority {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.as_deref().map(Priority::parse).unwrap_or_default())
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeListItem {
  pub code: String,
  pub label: String,
}

/// Server-maintained pick list (genders, facility kinds, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeList {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub items: Vec<CodeListItem>,
  #[serde(default)]
  pub updated_at: Option<String>,
}

impl CodeList {
  pub fn label_for(&self, code: &str) -> Option<&str> {
    self
      .items
      .iter()
      .find(|item| item.code == code)
      .map(|item| item.label.as_str())
  }
}

/// Per-priority patient counts for a scene dashboard
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityCounts {
  pub immediate: usize,
  pub delayed: usize,
  pub minimal: usize,
  pub expectant: usize,
  pub dead: usize,
  pub unknown: usize,
  pub total: usize,
  pub transported: usize,
}

impl PriorityCounts {
  pub fn from_patients(patients: &[Patient]) -> Self {
    let mut counts = Self::default();
    for patient in patients {
      match patient.priority {
        Priority::Immediate => counts.immediate += 1,
        Priority::Delayed => counts.delayed += 1,
        Priority::Minimal => counts.minimal += 1,
        Priority::Expectant => counts.expectant += 1,
        Priority::Dead => counts.dead += 1,
        Priority::Unknown => counts.unknown += 1,
      }
      if patient.is_transported() {
        counts.transported += 1;
      }
      counts.total += 1;
    }
    counts
  }

  pub fn get(&self, priority: Priority) -> usize {
    match priority {
      Priority::Immediate => self.immediate,
      Priority::Delayed => self.delayed,
      Priority::Minimal => self.minimal,
      Priority::Expectant => self.expectant,
      Priority::Dead => self.dead,
      Priority::Unknown => self.unknown,
    }
  }
}

impl fmt::Display for PriorityCounts {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "immediate {} / delayed {} / minimal {} / expectant {} / dead {} (total {}, transported {})",
      self.immediate,
      self.delayed,
      self.minimal,
      self.expectant,
      self.dead,
      self.total,
      self.transported
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn patient(id: &str, priority: Priority, transported: bool) -> Patient {
    Patient {
      id: id.to_string(),
      pin: None,
      scene_id: Some("s1".into()),
      first_name: None,
      last_name: None,
      age: None,
      gender: None,
      priority,
      location: None,
      transport_facility_id: None,
      transport_agency_id: None,
      transported_at: transported.then(|| "2026-10-16T10:00:00Z".to_string()),
      updated_at: None,
    }
  }

  #[test]
  fn test_priority_parsing() {
    assert_eq!(Priority::parse("IMMEDIATE"), Priority::Immediate);
    assert_eq!(Priority::parse("green"), Priority::Minimal);
    assert_eq!(Priority::parse("purple"), Priority::Unknown);

    let p: Patient = serde_json::from_value(json!({"id": "1", "priority": null})).unwrap();
    assert_eq!(p.priority, Priority::Unknown);

    let p: Patient = serde_json::from_value(json!({"id": "1", "priority": "delayed"})).unwrap();
    assert_eq!(p.priority, Priority::Delayed);
    assert_eq!(serde_json::to_value(&p).unwrap()["priority"], "delayed");
  }

  #[test]
  fn test_priority_counts() {
    let patients = vec![
      patient("1", Priority::Immediate, false),
      patient("2", Priority::Immediate, true),
      patient("3", Priority::Minimal, false),
      patient("4", Priority::Dead, false),
    ];
    let counts = PriorityCounts::from_patients(&patients);
    assert_eq!(counts.immediate, 2);
    assert_eq!(counts.get(Priority::Minimal), 1);
    assert_eq!(counts.dead, 1);
    assert_eq!(counts.delayed, 0);
    assert_eq!(counts.total, 4);
    assert_eq!(counts.transported, 1);
  }

  #[test]
  fn test_full_name_skips_missing_parts() {
    let mut p = patient("1", Priority::Delayed, false);
    assert_eq!(p.full_name(), "");
    p.last_name = Some("Lovelace".into());
    assert_eq!(p.full_name(), "Lovelace");
    p.first_name = Some("Ada".into());
    assert_eq!(p.full_name(), "Ada Lovelace");
  }

  #[test]
  fn test_code_list_lookup() {
    let list: CodeList = serde_json::from_value(json!({
      "id": "gender",
      "name": "Gender",
      "items": [{"code": "F", "label": "Female"}, {"code": "M", "label": "Male"}]
    }))
    .unwrap();
    assert_eq!(list.label_for("F"), Some("Female"));
    assert_eq!(list.label_for("X"), None);
  }
}
