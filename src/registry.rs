//! The set of labels, relationship types and indexes this pipeline owns.
//!
//! Everything else in a store is foreign. The sync engine only ever deletes what
//! this module names, and the diff tool's managed-only scope reads the same tables.

use std::collections::BTreeSet;

/// A node label together with the property that identifies its nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeType {
    pub label: &'static str,
    pub key: &'static str,
}

/// A directed relationship type between two node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipType {
    pub name: &'static str,
    pub from: NodeType,
    pub to: NodeType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub property: &'static str,
}

pub const PAPER: NodeType = NodeType {
    label: "Paper",
    key: "id",
};

pub const REPOSITORY: NodeType = NodeType {
    label: "Repository",
    key: "url",
};

pub const DATASET: NodeType = NodeType {
    label: "Dataset",
    key: "id",
};

pub const TASK: NodeType = NodeType {
    label: "Task",
    key: "id",
};

pub const AUTHOR: NodeType = NodeType {
    label: "Author",
    key: "name",
};

pub const AUTHORED: RelationshipType = RelationshipType {
    name: "AUTHORED",
    from: AUTHOR,
    to: PAPER,
};

pub const HAS_CODE: RelationshipType = RelationshipType {
    name: "HAS_CODE",
    from: PAPER,
    to: REPOSITORY,
};

pub const USES_DATASET: RelationshipType = RelationshipType {
    name: "USES_DATASET",
    from: PAPER,
    to: DATASET,
};

pub const ADDRESSES_TASK: RelationshipType = RelationshipType {
    name: "ADDRESSES_TASK",
    from: PAPER,
    to: TASK,
};

pub const MANAGED_NODE_TYPES: [NodeType; 5] = [PAPER, REPOSITORY, DATASET, TASK, AUTHOR];

pub const MANAGED_RELATIONSHIP_TYPES: [RelationshipType; 4] =
    [AUTHORED, HAS_CODE, USES_DATASET, ADDRESSES_TASK];

pub const MANAGED_INDEXES: [IndexSpec; 6] = [
    IndexSpec {
        name: "paper_id_index",
        label: "Paper",
        property: "id",
    },
    IndexSpec {
        name: "paper_arxiv_index",
        label: "Paper",
        property: "arxiv_id",
    },
    IndexSpec {
        name: "repo_url_index",
        label: "Repository",
        property: "url",
    },
    IndexSpec {
        name: "author_name_index",
        label: "Author",
        property: "name",
    },
    IndexSpec {
        name: "dataset_id_index",
        label: "Dataset",
        property: "id",
    },
    IndexSpec {
        name: "task_id_index",
        label: "Task",
        property: "id",
    },
];

pub fn is_managed_label(name: &str) -> bool {
    MANAGED_NODE_TYPES.iter().any(|t| t.label == name)
}

pub fn is_managed_relationship(name: &str) -> bool {
    MANAGED_RELATIONSHIP_TYPES.iter().any(|t| t.name == name)
}

pub fn managed_index_names() -> BTreeSet<&'static str> {
    MANAGED_INDEXES.iter().map(|i| i.name).collect()
}

pub fn node_type(label: &str) -> Option<&'static NodeType> {
    MANAGED_NODE_TYPES.iter().find(|t| t.label == label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn managed_labels() {
        for label in ["Paper", "Repository", "Dataset", "Task", "Author"] {
            assert!(is_managed_label(label), "{label} should be managed");
        }
    }

    #[test]
    fn foreign_labels_are_not_managed() {
        assert!(!is_managed_label("User"));
        assert!(!is_managed_label("paper"));
        assert!(!is_managed_label(""));
    }

    #[test]
    fn managed_relationships() {
        assert!(is_managed_relationship("AUTHORED"));
        assert!(is_managed_relationship("HAS_CODE"));
        assert!(is_managed_relationship("USES_DATASET"));
        assert!(is_managed_relationship("ADDRESSES_TASK"));
        assert!(!is_managed_relationship("OWNS"));
        assert!(!is_managed_relationship("authored"));
    }

    #[test]
    fn index_names() {
        let names = managed_index_names();
        assert_eq!(names.len(), 6);
        assert!(names.contains("paper_id_index"));
        assert!(names.contains("task_id_index"));
        assert!(!names.contains("user_id_index"));
    }

    #[test]
    fn relationship_endpoints_are_managed() {
        for rel in MANAGED_RELATIONSHIP_TYPES {
            assert!(is_managed_label(rel.from.label));
            assert!(is_managed_label(rel.to.label));
        }
    }

    #[test]
    fn indexes_cover_every_key() {
        for node in MANAGED_NODE_TYPES {
            assert!(
                MANAGED_INDEXES
                    .iter()
                    .any(|i| i.label == node.label && i.property == node.key),
                "no index on {}.{}",
                node.label,
                node.key
            );
        }
    }

    #[test]
    fn node_type_lookup() {
        assert_eq!(node_type("Repository").map(|t| t.key), Some("url"));
        assert_eq!(node_type("Author").map(|t| t.key), Some("name"));
        assert!(node_type("User").is_none());
    }
}
