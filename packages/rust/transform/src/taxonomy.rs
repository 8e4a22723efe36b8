//! Ordered, first-match-wins category mapping.

use std::collections::{BTreeSet, HashSet};

use catalogsync_shared::{CatalogSyncError, CategoryNode, CategoryPath, Result};

struct TaxonomyNode {
    node: CategoryNode,
    collections: HashSet<String>,
    product_types: HashSet<String>,
    children: Vec<TaxonomyNode>,
}

impl TaxonomyNode {
    fn new(node: CategoryNode) -> Self {
        Self {
            collections: node.collections.iter().map(|c| normalize(c)).collect(),
            product_types: node.product_types.iter().map(|t| normalize(t)).collect(),
            node,
            children: Vec::new(),
        }
    }

    fn matches_collection(&self, collections: &HashSet<String>) -> bool {
        !self.collections.is_disjoint(collections)
    }

    fn matches_type(&self, product_type: &str) -> bool {
        !product_type.is_empty() && self.product_types.contains(product_type)
    }
}

fn normalize(s: &str) -> String {
    s.trim().to_lowercase()
}

/// Two-level category tree evaluated in declaration order.
pub struct Taxonomy {
    roots: Vec<TaxonomyNode>,
    default: CategoryPath,
}

impl Taxonomy {
    /// Build the tree. Children attach to their parent in declaration order.
    ///
    /// Duplicate handles, unknown parents and nesting deeper than one level are
    /// configuration errors.
    pub fn from_nodes(nodes: &[CategoryNode], default: &CategoryNode) -> Result<Self> {
        let mut handles = HashSet::new();
        for node in nodes {
            if !handles.insert(node.handle.as_str()) {
                return Err(CatalogSyncError::config(format!(
                    "category handle '{}' is declared more than once",
                    node.handle
                )));
            }
        }

        let mut roots: Vec<TaxonomyNode> = nodes
            .iter()
            .filter(|n| n.parent.is_none())
            .cloned()
            .map(TaxonomyNode::new)
            .collect();

        for node in nodes.iter().filter(|n| n.parent.is_some()) {
            let parent = node.parent.as_deref().unwrap_or_default();
            match roots.iter_mut().find(|r| r.node.handle == parent) {
                Some(root) => root.children.push(TaxonomyNode::new(node.clone())),
                None if handles.contains(parent) => {
                    return Err(CatalogSyncError::config(format!(
                        "category '{}' nests under '{parent}', which is itself a child; \
                         only two levels are supported",
                        node.handle
                    )));
                }
                None => {
                    return Err(CatalogSyncError::config(format!(
                        "category '{}' names unknown parent '{parent}'",
                        node.handle
                    )));
                }
            }
        }

        Ok(Self {
            roots,
            default: CategoryPath {
                handles: vec![default.handle.clone()],
                names: vec![default.name.clone()],
            },
        })
    }

    /// Map a product's collection handles and type to exactly one category.
    pub fn map(&self, collections: &BTreeSet<String>, product_type: &str) -> CategoryPath {
        let collections: HashSet<String> = collections.iter().map(|c| normalize(c)).collect();

        if let Some(path) = self.first_match(|n| n.matches_collection(&collections)) {
            return path;
        }

        let product_type = normalize(product_type);
        if let Some(path) = self.first_match(|n| n.matches_type(&product_type)) {
            return path;
        }

        self.default.clone()
    }

    fn first_match(&self, pred: impl Fn(&TaxonomyNode) -> bool) -> Option<CategoryPath> {
        for root in &self.roots {
            if pred(root) {
                return Some(path_of(&[&root.node]));
            }
            for child in &root.children {
                if pred(child) {
                    return Some(path_of(&[&root.node, &child.node]));
                }
            }
        }
        None
    }
}

fn path_of(levels: &[&CategoryNode]) -> CategoryPath {
    CategoryPath {
        handles: levels.iter().map(|n| n.handle.clone()).collect(),
        names: levels.iter().map(|n| n.name.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(handle: &str, parent: Option<&str>, collections: &[&str], types: &[&str]) -> CategoryNode {
        CategoryNode {
            name: handle.to_uppercase(),
            handle: handle.into(),
            parent: parent.map(String::from),
            collections: collections.iter().map(|c| c.to_string()).collect(),
            product_types: types.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn default_node() -> CategoryNode {
        node("uncategorized", None, &[], &[])
    }

    fn taxonomy() -> Taxonomy {
        Taxonomy::from_nodes(
            &[
                node("hotends", None, &["hotends"], &["Hotend"]),
                node("nozzles", Some("hotends"), &["nozzles", "sale"], &["Nozzle"]),
                node("extruders", None, &["extruders"], &[]),
                node("deals", None, &["sale"], &[]),
            ],
            &default_node(),
        )
        .unwrap()
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn child_match_yields_parent_child_path() {
        let path = taxonomy().map(&set(&["nozzles"]), "");
        assert_eq!(path.to_string(), "hotends/nozzles");
        assert_eq!(path.names, vec!["HOTENDS", "NOZZLES"]);
    }

    #[test]
    fn first_configured_match_wins_regardless_of_product_order() {
        let tax = taxonomy();
        let a = tax.map(&set(&["extruders", "nozzles"]), "");
        let b = tax.map(&set(&["nozzles", "extruders"]), "");
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "hotends/nozzles");

        // "sale" sits on both a child and a later root; the earlier declaration wins.
        assert_eq!(tax.map(&set(&["sale"]), "").to_string(), "hotends/nozzles");
    }

    #[test]
    fn product_type_is_second_pass() {
        let tax = taxonomy();
        assert_eq!(tax.map(&set(&["unknown"]), " nozzle ").to_string(), "hotends/nozzles");
        assert_eq!(tax.map(&set(&[]), "HOTEND").to_string(), "hotends");
        // Collection match beats type match.
        assert_eq!(tax.map(&set(&["extruders"]), "Nozzle").to_string(), "extruders");
    }

    #[test]
    fn falls_back_to_default() {
        assert_eq!(taxonomy().map(&set(&["misc"]), "Widget").to_string(), "uncategorized");
    }

    #[test]
    fn rejects_unknown_parent_and_deep_nesting() {
        let err = Taxonomy::from_nodes(&[node("a", Some("nope"), &[], &[])], &default_node())
            .err()
            .unwrap();
        assert!(err.to_string().contains("unknown parent"));

        let err = Taxonomy::from_nodes(
            &[
                node("a", None, &[], &[]),
                node("b", Some("a"), &[], &[]),
                node("c", Some("b"), &[], &[]),
            ],
            &default_node(),
        )
        .err()
        .unwrap();
        assert!(err.to_string().contains("only two levels"));
    }

    #[test]
    fn rejects_duplicate_handles() {
        let err = Taxonomy::from_nodes(
            &[node("a", None, &[], &[]), node("a", None, &[], &[])],
            &default_node(),
        )
        .err()
        .unwrap();
        assert!(err.is_fatal());
    }
}
