//! Drive item model
//!
//! One node of an account's remote tree. Snapshots serialize a whole tree of
//! these rooted at a synthetic `root` folder.

use serde::{Deserialize, Serialize};

/// Provider discriminant for folders
pub const FOLDER_KIND: &str = "application/vnd.google-apps.folder";

/// Id of the synthetic root every snapshot hangs off
pub const ROOT_ID: &str = "root";

/// Action marker for items with a completed backup artifact
pub const ACTION_DOWNLOAD: &str = "Download";

/// A folder or file in the remote tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Stable provider identifier, unique within an account
    pub id: String,
    pub name: String,
    /// Provider kind (MIME type); folders use [`FOLDER_KIND`]
    #[serde(rename = "type")]
    pub kind: String,
    /// Declared parent; only used while building, never persisted
    #[serde(skip)]
    pub parent_id: Option<String>,
    /// Whether the item has byte content to transfer
    #[serde(default)]
    pub binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Opaque change marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Children, built by the tree builder (folders only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Item>>,
    /// Live download percentage (0-100) while a job is in flight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloading: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

impl Item {
    /// The synthetic root folder
    pub fn root() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            name: ROOT_ID.to_string(),
            kind: FOLDER_KIND.to_string(),
            ..Default::default()
        }
    }

    pub fn is_folder(&self) -> bool {
        self.kind == FOLDER_KIND
    }

    /// Copy without parent link or nested children, as returned by folder lookups
    pub fn redacted(&self) -> Self {
        Self {
            parent_id: None,
            children: None,
            ..self.clone()
        }
    }

    /// Breadth-first iterator over this item and all descendants
    pub fn walk(&self) -> Walk<'_> {
        let mut queue = std::collections::VecDeque::new();
        queue.push_back(self);
        Walk { queue }
    }
}

/// Breadth-first traversal over a tree of items
pub struct Walk<'a> {
    queue: std::collections::VecDeque<&'a Item>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.queue.pop_front()?;
        if let Some(children) = &item.children {
            self.queue.extend(children.iter());
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str, size: u64) -> Item {
        Item {
            id: id.to_string(),
            name: id.to_string(),
            kind: "text/plain".to_string(),
            binary: true,
            size: Some(size),
            ..Default::default()
        }
    }

    #[test]
    fn test_walk_is_breadth_first() {
        let mut a = Item {
            id: "a".to_string(),
            kind: FOLDER_KIND.to_string(),
            ..Default::default()
        };
        a.children = Some(vec![file("a1", 1)]);
        let mut root = Item::root();
        root.children = Some(vec![a, file("b", 2)]);

        let order: Vec<&str> = root.walk().map(|i| i.id.as_str()).collect();
        assert_eq!(order, vec!["root", "a", "b", "a1"]);
    }

    #[test]
    fn test_redacted_drops_links() {
        let mut folder = Item::root();
        folder.parent_id = Some("x".to_string());
        folder.children = Some(vec![file("f", 3)]);

        let copy = folder.redacted();
        assert!(copy.children.is_none());
        assert!(copy.parent_id.is_none());
        assert_eq!(copy.id, "root");
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(file("f", 10)).unwrap();
        assert_eq!(json["type"], "text/plain");
        assert_eq!(json["size"], 10);
        assert!(json.get("children").is_none());
        assert!(json.get("actions").is_none());
        assert!(json.get("parentId").is_none());
    }
}
