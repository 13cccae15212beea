//! Content hashing and change classification.
//!
//! Entities are serialized to JSON with object keys sorted at every level
//! before hashing, so neither field order nor map ordering can make an
//! unchanged entity look updated. The digest is only an equality check.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::entity::CanonicalEntity;

/// What a sync run has to do with a fetched entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
	/// Never stored before
	Created,
	/// Stored with a different hash
	Updated,
	/// Stored with the same hash; no write is issued
	Unchanged,
}

/// Outcome of [`classify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
	/// Required action
	pub action: ChangeAction,
	/// Hash of the fetched entity
	pub hash: String,
}

/// Classify a fetched entity against the hash stored by a previous run.
#[must_use]
pub fn classify(existing_hash: Option<&str>, entity: &CanonicalEntity) -> Classification {
	let hash = content_hash(entity);
	let action = match existing_hash {
		None => ChangeAction::Created,
		Some(existing) if existing == hash => ChangeAction::Unchanged,
		Some(_) => ChangeAction::Updated,
	};
	Classification { action, hash }
}

/// Hex-encoded SHA-256 over the canonical serialization of an entity
#[must_use]
pub fn content_hash(entity: &CanonicalEntity) -> String {
	let mut hasher = Sha256::new();
	hasher.update(canonical_json(entity).as_bytes());
	hex::encode(hasher.finalize())
}

/// Serialize an entity with sorted object keys
fn canonical_json(entity: &CanonicalEntity) -> String {
	// Serializing plain structs and enums cannot fail
	let value = serde_json::to_value(entity).unwrap_or(Value::Null);
	let mut out = String::new();
	write_sorted(&value, &mut out);
	out
}

/// Write `value` as compact JSON, sorting object keys recursively
fn write_sorted(value: &Value, out: &mut String) {
	match value {
		Value::Object(map) => {
			let mut entries: Vec<_> = map.iter().collect();
			entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
			out.push('{');
			for (index, (key, value)) in entries.into_iter().enumerate() {
				if index > 0 {
					out.push(',');
				}
				out.push_str(&Value::String(key.clone()).to_string());
				out.push(':');
				write_sorted(value, out);
			}
			out.push('}');
		}
		Value::Array(items) => {
			out.push('[');
			for (index, item) in items.iter().enumerate() {
				if index > 0 {
					out.push(',');
				}
				write_sorted(item, out);
			}
			out.push(']');
		}
		scalar => out.push_str(&scalar.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;
	use crate::entity::{CanonicalGroup, CanonicalUser};

	fn user(email: &str) -> CanonicalEntity {
		CanonicalEntity::User(CanonicalUser {
			email: email.to_owned(),
			given_name: "Bob".to_owned(),
			family_name: "Tables".to_owned(),
			display_name: "Bob Tables".to_owned(),
			active: true,
			org_unit: Some("/Engineering".to_owned()),
			job_title: None,
			is_admin: false,
		})
	}

	#[test]
	fn test_classify_created_without_prior_hash() {
		let classification = classify(None, &user("bob@example.com"));
		assert_eq!(classification.action, ChangeAction::Created);
		assert_eq!(classification.hash.len(), 64);
	}

	#[test]
	fn test_classify_unchanged_and_updated() {
		let stored = content_hash(&user("bob@example.com"));

		let same = classify(Some(&stored), &user("bob@example.com"));
		assert_eq!(same.action, ChangeAction::Unchanged);
		assert_eq!(same.hash, stored);

		let changed = classify(Some(&stored), &user("robert@example.com"));
		assert_eq!(changed.action, ChangeAction::Updated);
		assert_ne!(changed.hash, stored);
	}

	#[test]
	fn test_hash_differs_between_kinds() {
		let group = CanonicalEntity::Group(CanonicalGroup {
			email: "bob@example.com".to_owned(),
			name: "Bob Tables".to_owned(),
			description: None,
		});
		assert_ne!(content_hash(&group), content_hash(&user("bob@example.com")));
	}

	#[test]
	fn test_sorted_serialization_ignores_key_order() {
		let mut first = String::new();
		write_sorted(&json!({"b": 1, "a": {"y": [true, null], "x": "s"}}), &mut first);
		let mut second = String::new();
		write_sorted(&json!({"a": {"x": "s", "y": [true, null]}, "b": 1}), &mut second);

		assert_eq!(first, second);
		assert_eq!(first, r#"{"a":{"x":"s","y":[true,null]},"b":1}"#);
	}
}
