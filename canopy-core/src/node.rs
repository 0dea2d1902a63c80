//! Navigation helpers over encoded tree nodes.
//!
//! Nodes are `serde_json::Value`s; containers are JSON objects.

use serde_json::{Map, Value};

/// Follow `segments` down from `root`.
pub fn lookup<'a, S: AsRef<str>>(root: &'a Value, segments: &[S]) -> Option<&'a Value> {
    segments
        .iter()
        .try_fold(root, |node, segment| node.as_object()?.get(segment.as_ref()))
}

/// Mutable variant of [`lookup`].
pub fn lookup_mut<'a, S: AsRef<str>>(root: &'a mut Value, segments: &[S]) -> Option<&'a mut Value> {
    segments.iter().try_fold(root, |node, segment| {
        node.as_object_mut()?.get_mut(segment.as_ref())
    })
}

/// The map at `segments`, if that node exists and is a container.
pub fn container_mut<'a, S: AsRef<str>>(
    root: &'a mut Value,
    segments: &[S],
) -> Option<&'a mut Map<String, Value>> {
    lookup_mut(root, segments)?.as_object_mut()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup() {
        let tree = json!({"a": {"b": {"c": 3}}, "s": "str"});
        assert_eq!(lookup(&tree, &["a", "b", "c"]), Some(&json!(3)));
        assert_eq!(lookup::<&str>(&tree, &[]), Some(&tree));
        assert_eq!(lookup(&tree, &["a", "missing"]), None);
        assert_eq!(lookup(&tree, &["s", "x"]), None);
    }

    #[test]
    fn test_container_mut() {
        let mut tree = json!({"a": {"b": 1}});
        container_mut(&mut tree, &["a"]).unwrap().insert("c".into(), json!(2));
        assert_eq!(tree, json!({"a": {"b": 1, "c": 2}}));
        assert!(container_mut(&mut tree, &["a", "b"]).is_none());
    }
}
