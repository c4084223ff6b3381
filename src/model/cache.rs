//! Store bindings for the mirrored entities.

use crate::cache::Cacheable;

use super::{Agency, CodeList, Facility, Patient, Responder, Scene};

macro_rules! cacheable {
  ($ty:ty, $name:literal) => {
    impl Cacheable for $ty {
      fn cache_key(&self) -> String {
        self.id.clone()
      }

      fn updated_at(&self) -> Option<&str> {
        self.updated_at.as_deref()
      }

      fn entity_type() -> &'static str {
        $name
      }
    }
  };
}

cacheable!(Agency, "agency");
cacheable!(Facility, "facility");
cacheable!(Scene, "scene");
cacheable!(Responder, "responder");
cacheable!(Patient, "patient");
cacheable!(CodeList, "code_list");

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::collections::HashSet;

  #[test]
  fn test_entity_types_are_distinct() {
    let names: HashSet<_> = [
      Agency::entity_type(),
      Facility::entity_type(),
      Scene::entity_type(),
      Responder::entity_type(),
      Patient::entity_type(),
      CodeList::entity_type(),
    ]
    .into_iter()
    .collect();
    assert_eq!(names.len(), 6);
  }

  #[test]
  fn test_key_and_updated_at_come_from_the_record() {
    let patient: Patient = serde_json::from_value(json!({
      "id": "p-9",
      "updated_at": "2026-10-16T08:00:00Z",
    }))
    .unwrap();
    assert_eq!(patient.cache_key(), "p-9");
    assert_eq!(Cacheable::updated_at(&patient), Some("2026-10-16T08:00:00Z"));
  }
}
