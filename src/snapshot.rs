//! Surface listing snapshots and the structural patches pushed to observers
//!
//! Observers get the full listing once and then only RFC 6902 JSON patches
//! against it.

use json_patch::{PatchOperation, ReplaceOperation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use surface_transport::{IntegrationType, PanelConfig};

/// One surface as shown in the listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceSummary {
    pub id: String,
    pub name: String,
    /// Hardware family
    #[serde(rename = "type")]
    pub family: String,
    pub display_name: String,
    pub integration_type: Option<IntegrationType>,
    pub is_connected: bool,
    pub location: Option<String>,
    pub config: PanelConfig,
    pub locked: bool,
}

/// One group with its surfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub id: String,
    pub name: String,
    pub is_auto: bool,
    pub current_page: u32,
    pub surfaces: Vec<SurfaceSummary>,
}

pub use json_patch::Patch;

/// Patch turning `old` into `new`
pub fn diff(old: &Value, new: &Value) -> Patch {
    json_patch::diff(old, new)
}

/// Patch that replaces the whole document, sent before any diff
pub fn full_listing(listing: Value) -> Patch {
    Patch(vec![PatchOperation::Replace(ReplaceOperation {
        value: listing,
        ..Default::default()
    })])
}

/// Apply a patch in place
///
/// Returns false, leaving the document untouched, if an op does not fit it.
pub fn apply(doc: &mut Value, patch: &Patch) -> bool {
    json_patch::patch(doc, patch).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_identical_documents_produce_no_ops() {
        let doc = json!([{"id": "a", "surfaces": [1, 2]}]);
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn test_scalar_change_is_replace() {
        let old = json!([{"id": "a", "current_page": 1}]);
        let new = json!([{"id": "a", "current_page": 5}]);
        assert_eq!(
            serde_json::to_value(diff(&old, &new)).unwrap(),
            json!([{"op": "replace", "path": "/0/current_page", "value": 5}])
        );
    }

    #[test]
    fn test_keys_are_escaped() {
        let old = json!({});
        let new = json!({"a/b~c": 1});
        let patch = diff(&old, &new);
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "add", "path": "/a~1b~0c", "value": 1}])
        );
        let mut doc = old.clone();
        assert!(apply(&mut doc, &patch));
        assert_eq!(doc, new);
    }

    #[test]
    fn test_patch_reproduces_listing_change() {
        let old = json!([
            {"id": "group:1", "surfaces": [{"id": "a", "is_connected": true}]},
            {"id": "b", "surfaces": [{"id": "b", "is_connected": true}]},
            {"id": "c", "surfaces": []},
        ]);
        let new = json!([
            {"id": "group:1", "surfaces": [
                {"id": "a", "is_connected": false},
                {"id": "b", "is_connected": true}
            ]},
        ]);
        let mut doc = old.clone();
        assert!(apply(&mut doc, &diff(&old, &new)));
        assert_eq!(doc, new);
    }

    #[test]
    fn test_full_listing_replaces_anything() {
        let listing = json!([{"id": "a", "surfaces": []}]);
        let patch = full_listing(listing.clone());
        assert_eq!(
            serde_json::to_value(&patch).unwrap(),
            json!([{"op": "replace", "path": "", "value": listing}])
        );
        let mut doc = Value::Null;
        assert!(apply(&mut doc, &patch));
        assert_eq!(doc, listing);
    }

    #[test]
    fn test_apply_rejects_bad_path() {
        let mut doc = json!({"a": [1]});
        let bad: Patch =
            serde_json::from_value(json!([{"op": "remove", "path": "/a/5"}])).unwrap();
        assert!(!apply(&mut doc, &bad));
        let bad: Patch =
            serde_json::from_value(json!([{"op": "remove", "path": "/x/y"}])).unwrap();
        assert!(!apply(&mut doc, &bad));
        assert_eq!(doc, json!({"a": [1]}));
    }
}
