//! Splits a large state document into independently stored fragments and
//! puts it back together.
//!
//! ```text
//!   {catalog: {e1: {x:1}, e2: {x:2}}}          graft point: /catalog
//!                 │ scatter
//!                 ▼
//!   [catalog, e1] → {x:1}
//!   [catalog, e2] → {x:2}
//!   []            → {catalog: {e1: true, e2: true}}     (root fragment)
//!                 │ gather (any order)
//!                 ▼
//!   {catalog: {e1: {x:1}, e2: {x:2}}}
//! ```
//!
//! The only contract between [`DocumentSurgeon::scatter`] and
//! [`DocumentSurgeon::gather`] is the fragment address: an ordered list of
//! segments from the root. Gather knows nothing about graft points, so
//! fragments written under an older splitting policy stay readable.

use canopy_core::node;
use canopy_core::{Path, PathError, Reference};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stands in for an entry whose value lives in its own fragment.
pub const PLACEHOLDER: Value = Value::Bool(true);

/// Errors from splitting or reassembling documents.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SurgeonError {
    #[error("no root fragment among {0} fragments")]
    MissingRoot(usize),
    #[error("more than one root fragment")]
    DuplicateRoot,
    #[error("fragment {0:?} has no container to graft into")]
    DanglingAddress(Vec<String>),
    #[error("{0} is not a container")]
    NotAContainer(Path),
    #[error("{target} is not under root {root}")]
    OutsideRoot { root: Path, target: Path },
    #[error(transparent)]
    InvalidTarget(#[from] PathError),
}

/// One self-describing piece of a split document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub address: Vec<String>,
    pub payload: Value,
}

impl Fragment {
    pub fn new(address: Vec<String>, payload: Value) -> Self {
        Self { address, payload }
    }

    pub fn root(payload: Value) -> Self {
        Self::new(Vec::new(), payload)
    }

    pub fn is_root(&self) -> bool {
        self.address.is_empty()
    }
}

/// A collection whose entries are stored as separate fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraftPoint {
    collection: Path,
}

impl GraftPoint {
    pub fn new(collection: Path) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> &Path {
        &self.collection
    }

    /// Whether concrete `path` names an entry of this collection.
    pub fn contains_entry(&self, path: &Path) -> bool {
        path.len() == self.collection.len() + 1
            && self.collection.covers(&path.truncated_to(self.collection.len()))
    }
}

/// Scatters and gathers documents according to a fixed set of graft points.
#[derive(Debug, Clone, Default)]
pub struct DocumentSurgeon {
    /// Deepest first, so nested collections are extracted before the
    /// entries that contain them.
    graft_points: Vec<GraftPoint>,
}

impl DocumentSurgeon {
    pub fn new<I>(collections: I) -> Self
    where
        I: IntoIterator<Item = Reference>,
    {
        let mut graft_points: Vec<GraftPoint> = collections
            .into_iter()
            .map(|r| GraftPoint::new(r.path().clone()))
            .collect();
        graft_points.sort_by(|a, b| b.collection.len().cmp(&a.collection.len()));
        Self { graft_points }
    }

    pub fn graft_points(&self) -> &[GraftPoint] {
        &self.graft_points
    }

    /// Whether writing `path` creates or replaces a whole fragment.
    pub fn is_graft_entry(&self, path: &Path) -> bool {
        self.graft_points.iter().any(|g| g.contains_entry(path))
    }

    /// Whether any fragment could live at or below `path`.
    pub fn has_graft_points_within(&self, path: &Path) -> bool {
        self.graft_points
            .iter()
            .any(|g| g.collection.len() >= path.len() && g.collection.truncated_to(path.len()).covers(path))
    }

    /// Split `document`, the value at `target`, into fragments.
    ///
    /// Extracted entries are replaced in place by [`PLACEHOLDER`]. Addresses
    /// are relative to `root`. The last fragment always has an empty address
    /// and carries what remains of `document`.
    pub fn scatter(
        &self,
        root: &Reference,
        target: &Reference,
        document: &mut Value,
    ) -> Result<Vec<Fragment>, SurgeonError> {
        let target_path = target.require_concrete()?;
        if target_path.strip_prefix(root.path()).is_none() {
            return Err(SurgeonError::OutsideRoot {
                root: root.path().clone(),
                target: target_path.clone(),
            });
        }
        let mut parts = Vec::new();
        for graft_point in &self.graft_points {
            self.scatter_collection(root.path(), target_path, &graft_point.collection, document, &mut parts)?;
        }
        parts.push(Fragment::root(std::mem::replace(document, Value::Null)));
        *document = parts.last().map(|f| f.payload.clone()).unwrap_or(Value::Null);
        Ok(parts)
    }

    fn scatter_collection(
        &self,
        root: &Path,
        target: &Path,
        collection: &Path,
        document: &mut Value,
        parts: &mut Vec<Fragment>,
    ) -> Result<(), SurgeonError> {
        // Entries must lie strictly below the target
        if collection.len() < target.len() || !collection.truncated_to(target.len()).covers(target) {
            return Ok(());
        }
        let collection = collection.bound_by(target);
        // Parameters are bound by position; a key that looks like a
        // parameter must not be taken for one on the next pass
        let parameters = collection.parameter_indices();
        let mut segments = collection.into_segments();
        self.scatter_bound(root, target.len(), &mut segments, &parameters, document, parts)
    }

    fn scatter_bound(
        &self,
        root: &Path,
        depth: usize,
        segments: &mut Vec<String>,
        parameters: &[usize],
        document: &mut Value,
        parts: &mut Vec<Fragment>,
    ) -> Result<(), SurgeonError> {
        if let Some((&index, rest)) = parameters.split_first() {
            let keys: Vec<String> = match node::lookup(document, &segments[depth..index]) {
                None => return Ok(()),
                Some(Value::Object(map)) => map.keys().cloned().collect(),
                Some(_) => return Err(SurgeonError::NotAContainer(Path::of(segments[..index].iter().cloned()))),
            };
            for key in keys {
                segments[index] = key;
                self.scatter_bound(root, depth, segments, rest, document, parts)?;
            }
            return Ok(());
        }

        let collection = Path::of(segments.iter().cloned());
        let base = collection
            .strip_prefix(root)
            .ok_or_else(|| SurgeonError::OutsideRoot {
                root: root.clone(),
                target: collection.clone(),
            })?
            .to_vec();
        let container = match node::lookup_mut(document, &segments[depth..]) {
            None => return Ok(()),
            Some(Value::Object(map)) => map,
            Some(_) => return Err(SurgeonError::NotAContainer(collection)),
        };
        for (key, value) in container.iter_mut() {
            let mut address = base.clone();
            address.push(key.clone());
            parts.push(Fragment::new(address, std::mem::replace(value, PLACEHOLDER)));
        }
        Ok(())
    }

    /// Reassemble a document from fragments given in any order.
    pub fn gather(fragments: Vec<Fragment>) -> Result<Value, SurgeonError> {
        let count = fragments.len();
        let mut fragments = fragments;
        // Stable: siblings keep their relative order
        fragments.sort_by_key(|f| f.address.len());

        let mut iter = fragments.into_iter();
        let mut whole = match iter.next() {
            Some(first) if first.is_root() => first.payload,
            _ => return Err(SurgeonError::MissingRoot(count)),
        };
        for fragment in iter {
            if fragment.is_root() {
                return Err(SurgeonError::DuplicateRoot);
            }
            graft(&mut whole, &fragment.address, fragment.payload)?;
        }
        Ok(whole)
    }

    /// Graft fragments with absolute addresses into `base`, the node found
    /// at `base_address`. Fragments may arrive in any order.
    pub fn graft_into(
        base_address: &[String],
        base: Value,
        fragments: Vec<Fragment>,
    ) -> Result<Value, SurgeonError> {
        let mut fragments = fragments;
        fragments.sort_by_key(|f| f.address.len());
        let mut whole = base;
        for fragment in fragments {
            let relative = fragment
                .address
                .strip_prefix(base_address)
                .filter(|rest| !rest.is_empty())
                .ok_or_else(|| SurgeonError::DanglingAddress(fragment.address.clone()))?;
            graft(&mut whole, relative, fragment.payload)?;
        }
        Ok(whole)
    }
}

/// Overwrite the node at `address` within `whole`, whose parent container
/// must already exist. An empty address replaces `whole` entirely.
pub fn graft(whole: &mut Value, address: &[String], payload: Value) -> Result<(), SurgeonError> {
    let Some((key, parent)) = address.split_last() else {
        *whole = payload;
        return Ok(());
    };
    let container = node::container_mut(whole, parent)
        .ok_or_else(|| SurgeonError::DanglingAddress(address.to_vec()))?;
    container.insert(key.clone(), payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn collection(text: &str) -> Reference {
        Reference::collection(Path::parse(text).unwrap())
    }

    fn address(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    fn scatter_root(surgeon: &DocumentSurgeon, tree: &Value) -> Vec<Fragment> {
        let mut doc = tree.clone();
        surgeon
            .scatter(&Reference::root(), &Reference::root(), &mut doc)
            .unwrap()
    }

    #[test]
    fn test_catalog_example() {
        let tree = json!({"catalog": {"e1": {"x": 1}, "e2": {"x": 2}}});
        let surgeon = DocumentSurgeon::new([collection("/catalog")]);
        let parts = scatter_root(&surgeon, &tree);

        assert_eq!(
            parts,
            vec![
                Fragment::new(address(&["catalog", "e1"]), json!({"x": 1})),
                Fragment::new(address(&["catalog", "e2"]), json!({"x": 2})),
                Fragment::root(json!({"catalog": {"e1": true, "e2": true}})),
            ]
        );
        assert_eq!(DocumentSurgeon::gather(parts).unwrap(), tree);
    }

    #[test]
    fn test_scatter_leaves_residual_in_document() {
        let mut doc = json!({"catalog": {"e1": {"x": 1}}, "name": "n"});
        let surgeon = DocumentSurgeon::new([collection("/catalog")]);
        surgeon
            .scatter(&Reference::root(), &Reference::root(), &mut doc)
            .unwrap();
        assert_eq!(doc, json!({"catalog": {"e1": true}, "name": "n"}));
    }

    #[test]
    fn test_gather_order_independent() {
        let tree = json!({
            "catalog": {
                "e1": {"catalog": {"c1": {"v": 1}, "c2": {"v": 2}}},
                "e2": {"catalog": {}}
            },
            "side": {"k": {"v": 3}}
        });
        let surgeon = DocumentSurgeon::new([
            collection("/catalog"),
            collection("/side"),
            collection("/catalog/-entity-/catalog"),
        ]);
        let parts = scatter_root(&surgeon, &tree);

        let mut reversed = parts.clone();
        reversed.reverse();
        assert_eq!(DocumentSurgeon::gather(reversed).unwrap(), tree);

        for shift in 0..parts.len() {
            let mut rotated = parts.clone();
            rotated.rotate_left(shift);
            assert_eq!(DocumentSurgeon::gather(rotated).unwrap(), tree, "rotation {shift}");
        }
    }

    #[test]
    fn test_nested_extraction() {
        let tree = json!({
            "catalog": {
                "e1": {"catalog": {"c1": {"v": 1}, "c2": {"v": 2}}},
                "e2": {"catalog": {"c3": {"v": 3}}}
            }
        });
        let surgeon = DocumentSurgeon::new([
            collection("/catalog"),
            collection("/catalog/-entity-/catalog"),
        ]);
        let parts = scatter_root(&surgeon, &tree);
        let addresses: Vec<Vec<String>> = parts.iter().map(|f| f.address.clone()).collect();

        for expected in [
            address(&["catalog", "e1", "catalog", "c1"]),
            address(&["catalog", "e1", "catalog", "c2"]),
            address(&["catalog", "e2", "catalog", "c3"]),
            address(&["catalog", "e1"]),
            address(&["catalog", "e2"]),
        ] {
            assert!(addresses.contains(&expected), "missing {expected:?}");
        }
        assert_eq!(parts.len(), 6);

        let e1 = parts
            .iter()
            .find(|f| f.address == address(&["catalog", "e1"]))
            .unwrap();
        assert_eq!(e1.payload, json!({"catalog": {"c1": true, "c2": true}}));
        assert_eq!(DocumentSurgeon::gather(parts).unwrap(), tree);
    }

    #[test]
    fn test_scatter_subtree_target() {
        let surgeon = DocumentSurgeon::new([collection("/catalog/-entity-/catalog")]);
        let mut entity = json!({"catalog": {"c1": {"v": 1}}});
        let target = Reference::parse("/catalog/e9").unwrap();
        let parts = surgeon.scatter(&Reference::root(), &target, &mut entity).unwrap();

        assert_eq!(
            parts,
            vec![
                Fragment::new(address(&["catalog", "e9", "catalog", "c1"]), json!({"v": 1})),
                Fragment::root(json!({"catalog": {"c1": true}})),
            ]
        );
    }

    #[test]
    fn test_scatter_skips_unrelated_and_missing_collections() {
        let surgeon = DocumentSurgeon::new([collection("/catalog"), collection("/absent")]);
        let mut doc = json!({"x": 1});
        let target = Reference::parse("/other").unwrap();
        let parts = surgeon.scatter(&Reference::root(), &target, &mut doc).unwrap();
        assert_eq!(parts, vec![Fragment::root(json!({"x": 1}))]);

        let parts = scatter_root(&surgeon, &json!({"catalog": {}}));
        assert_eq!(parts, vec![Fragment::root(json!({"catalog": {}}))]);
    }

    #[test]
    fn test_scatter_rejects_non_container() {
        let surgeon = DocumentSurgeon::new([collection("/catalog")]);
        let mut doc = json!({"catalog": 5});
        let result = surgeon.scatter(&Reference::root(), &Reference::root(), &mut doc);
        assert!(matches!(result, Err(SurgeonError::NotAContainer(_))));
    }

    #[test]
    fn test_gather_errors() {
        assert_eq!(DocumentSurgeon::gather(vec![]), Err(SurgeonError::MissingRoot(0)));

        let orphan = vec![Fragment::new(address(&["a", "b"]), json!(1))];
        assert_eq!(DocumentSurgeon::gather(orphan), Err(SurgeonError::MissingRoot(1)));

        let two_roots = vec![Fragment::root(json!({})), Fragment::root(json!({}))];
        assert_eq!(DocumentSurgeon::gather(two_roots), Err(SurgeonError::DuplicateRoot));

        let dangling = vec![
            Fragment::root(json!({"a": {}})),
            Fragment::new(address(&["b", "c"]), json!(1)),
        ];
        assert_eq!(
            DocumentSurgeon::gather(dangling),
            Err(SurgeonError::DanglingAddress(address(&["b", "c"])))
        );
    }

    #[test]
    fn test_graft_into_subtree() {
        let base = json!({"catalog": {"c1": true}, "name": "e9"});
        let fragments = vec![
            Fragment::new(address(&["catalog", "e9", "catalog", "c1", "deep"]), json!(7)),
            Fragment::new(address(&["catalog", "e9", "catalog", "c1"]), json!({})),
        ];
        let whole = DocumentSurgeon::graft_into(&address(&["catalog", "e9"]), base, fragments).unwrap();
        assert_eq!(whole, json!({"catalog": {"c1": {"deep": 7}}, "name": "e9"}));

        let stray = vec![Fragment::new(address(&["elsewhere", "x"]), json!(1))];
        assert!(DocumentSurgeon::graft_into(&address(&["catalog"]), json!({}), stray).is_err());
    }

    #[test]
    fn test_parameter_shaped_keys_are_plain_entries() {
        let tree = json!({"catalog": {"-x-": {"catalog": {"c1": {"v": 1}}}, "e2": {}}});
        let surgeon = DocumentSurgeon::new([
            collection("/catalog"),
            collection("/catalog/-entity-/catalog"),
        ]);
        let parts = scatter_root(&surgeon, &tree);
        let addresses: Vec<Vec<String>> = parts.iter().map(|f| f.address.clone()).collect();

        assert_eq!(parts.len(), 4);
        assert!(addresses.contains(&address(&["catalog", "-x-", "catalog", "c1"])));
        assert!(addresses.contains(&address(&["catalog", "-x-"])));
        assert!(addresses.contains(&address(&["catalog", "e2"])));
        assert_eq!(DocumentSurgeon::gather(parts).unwrap(), tree);
    }

    #[test]
    fn test_is_graft_entry() {
        let surgeon = DocumentSurgeon::new([
            collection("/catalog"),
            collection("/catalog/-entity-/catalog"),
        ]);
        assert!(surgeon.is_graft_entry(&Path::parse("/catalog/e1").unwrap()));
        assert!(surgeon.is_graft_entry(&Path::parse("/catalog/e1/catalog/c1").unwrap()));
        assert!(!surgeon.is_graft_entry(&Path::parse("/catalog").unwrap()));
        assert!(!surgeon.is_graft_entry(&Path::parse("/catalog/e1/name").unwrap()));
        // Stored addresses are literal: "-a-" is an ID, not a wildcard
        assert!(surgeon.is_graft_entry(&Path::of(["catalog", "-a-"])));
        assert!(!surgeon.is_graft_entry(&Path::of(["-a-", "e1"])));
        assert!(!surgeon.has_graft_points_within(&Path::of(["-a-"])));
    }
}
