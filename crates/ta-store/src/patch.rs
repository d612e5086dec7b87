// patch.rs — Add/Remove/Replace against the value tree.
//
// The patch engine is the only code that mutates a tree. It walks the path
// one segment at a time:
//
//   - objects: the segment is a field name
//   - arrays:  the segment is a decimal index ("-" appends, on Add only)
//   - scalars: cannot be walked through
//
// Add creates missing intermediate objects. Remove and Replace require
// every segment to exist. The root is special: it can be replaced by
// another object but never removed.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::path::Path;
use crate::value::{Map, Value};

/// The three patch operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    /// Insert (objects: insert or overwrite; arrays: insert and shift).
    Add,
    /// Delete an existing location.
    Remove,
    /// Overwrite an existing location.
    Replace,
}

impl fmt::Display for PatchOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchOp::Add => write!(f, "add"),
            PatchOp::Remove => write!(f, "remove"),
            PatchOp::Replace => write!(f, "replace"),
        }
    }
}

/// A data tree whose root is always an object.
///
/// The only constructor takes a [`Map`], and the only mutators go through
/// [`DataTree::apply`] / [`DataTree::make_dir`], which refuse to put a
/// non-object at the root.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTree {
    root: Value,
}

impl DataTree {
    pub fn new(root: Map) -> Self {
        Self {
            root: Value::Object(root),
        }
    }

    /// The root as a value (always `Value::Object`).
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Resolve `path` to the value stored there.
    pub fn lookup(&self, path: &Path) -> Option<&Value> {
        lookup(&self.root, path)
    }

    /// Apply one patch operation. `value` is ignored for Remove.
    pub fn apply(&mut self, op: PatchOp, path: &Path, value: Value) -> Result<(), StoreError> {
        if path.is_root() {
            return match op {
                PatchOp::Remove => Err(StoreError::RootCannotBeRemoved),
                PatchOp::Add | PatchOp::Replace => match value {
                    Value::Object(_) => {
                        self.root = value;
                        Ok(())
                    }
                    _ => Err(StoreError::RootMustBeObject),
                },
            };
        }

        let segments = path.segments();
        let (parents, leaf) = segments.split_at(segments.len() - 1);
        let mut node = &mut self.root;
        for (depth, segment) in parents.iter().enumerate() {
            node = descend(node, segment, op, path, depth)?;
        }
        apply_leaf(node, &leaf[0], op, path, value)
    }

    /// Create every missing object along `path`.
    ///
    /// Existing objects are left alone; any other value on the way is a
    /// conflict.
    pub fn make_dir(&mut self, path: &Path) -> Result<(), StoreError> {
        let mut node = &mut self.root;
        for (depth, segment) in path.segments().iter().enumerate() {
            let Value::Object(map) = node else {
                return Err(StoreError::PathConflict {
                    path: path.display_prefix(depth),
                });
            };
            node = map.entry(segment.clone()).or_insert_with(Value::object);
        }
        if node.is_object() {
            Ok(())
        } else {
            Err(StoreError::PathConflict {
                path: path.to_string(),
            })
        }
    }
}

impl Default for DataTree {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

/// Resolve `path` under `root`.
pub fn lookup<'a>(root: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.segments() {
        node = match node {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(index_of(segment)?)?,
            _ => return None,
        };
    }
    Some(node)
}

/// Step from `node` into its child named `segment`, the child being
/// segment `depth` of `path`.
fn descend<'a>(
    node: &'a mut Value,
    segment: &str,
    op: PatchOp,
    path: &Path,
    depth: usize,
) -> Result<&'a mut Value, StoreError> {
    match node {
        Value::Object(map) => {
            if op == PatchOp::Add {
                Ok(map.entry(segment.to_string()).or_insert_with(Value::object))
            } else {
                map.get_mut(segment).ok_or_else(|| StoreError::PathNotFound {
                    path: path.display_prefix(depth + 1),
                })
            }
        }
        Value::Array(items) => {
            let index = parse_index(segment, path, depth)?;
            items
                .get_mut(index)
                .ok_or_else(|| StoreError::IndexOutOfRange {
                    path: path.display_prefix(depth),
                    index: segment.to_string(),
                })
        }
        _ => Err(walk_through_scalar(op, path, depth)),
    }
}

fn apply_leaf(
    node: &mut Value,
    segment: &str,
    op: PatchOp,
    path: &Path,
    value: Value,
) -> Result<(), StoreError> {
    let depth = path.len() - 1;
    match node {
        Value::Object(map) => match op {
            PatchOp::Add => {
                map.insert(segment.to_string(), value);
                Ok(())
            }
            PatchOp::Replace => {
                let slot = map.get_mut(segment).ok_or_else(|| StoreError::PathNotFound {
                    path: path.to_string(),
                })?;
                *slot = value;
                Ok(())
            }
            PatchOp::Remove => map.remove(segment).map(|_| ()).ok_or_else(|| {
                StoreError::PathNotFound {
                    path: path.to_string(),
                }
            }),
        },
        Value::Array(items) => {
            if op == PatchOp::Add && segment == "-" {
                items.push(value);
                return Ok(());
            }
            let index = parse_index(segment, path, depth)?;
            let out_of_range = || StoreError::IndexOutOfRange {
                path: path.display_prefix(depth),
                index: segment.to_string(),
            };
            match op {
                PatchOp::Add => {
                    if index > items.len() {
                        return Err(out_of_range());
                    }
                    items.insert(index, value);
                }
                PatchOp::Replace => {
                    let slot = items.get_mut(index).ok_or_else(out_of_range)?;
                    *slot = value;
                }
                PatchOp::Remove => {
                    if index >= items.len() {
                        return Err(out_of_range());
                    }
                    items.remove(index);
                }
            }
            Ok(())
        }
        _ => Err(walk_through_scalar(op, path, depth)),
    }
}

fn walk_through_scalar(op: PatchOp, path: &Path, depth: usize) -> StoreError {
    if op == PatchOp::Add {
        StoreError::PathConflict {
            path: path.display_prefix(depth),
        }
    } else {
        StoreError::PathNotFound {
            path: path.display_prefix(depth + 1),
        }
    }
}

fn index_of(segment: &str) -> Option<usize> {
    if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    segment.parse().ok()
}

fn parse_index(segment: &str, path: &Path, depth: usize) -> Result<usize, StoreError> {
    index_of(segment).ok_or_else(|| StoreError::InvalidIndex {
        path: path.display_prefix(depth),
        segment: segment.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(json: &str) -> DataTree {
        match Value::from_json_slice(json.as_bytes()).unwrap() {
            Value::Object(map) => DataTree::new(map),
            other => panic!("not an object: {other}"),
        }
    }

    fn json(tree: &DataTree) -> String {
        tree.root().to_string()
    }

    #[test]
    fn add_creates_intermediate_objects() {
        let mut t = DataTree::default();
        t.apply(PatchOp::Add, &Path::from(["a", "b"]), Value::from(1))
            .unwrap();
        assert_eq!(json(&t), r#"{"a":{"b":1}}"#);
    }

    #[test]
    fn root_add_requires_object() {
        let mut t = tree("{}");
        let err = t
            .apply(PatchOp::Add, &Path::root(), Value::from(5))
            .unwrap_err();
        assert!(matches!(err, StoreError::RootMustBeObject));
        let err = t
            .apply(PatchOp::Replace, &Path::root(), Value::Array(vec![]))
            .unwrap_err();
        assert!(matches!(err, StoreError::RootMustBeObject));

        let mut obj = Map::new();
        obj.insert("not".into(), Value::from("object"));
        t.apply(PatchOp::Add, &Path::root(), Value::Object(obj))
            .unwrap();
        assert_eq!(json(&t), r#"{"not":"object"}"#);
    }

    #[test]
    fn root_cannot_be_removed() {
        let mut t = tree(r#"{"a":1}"#);
        let err = t
            .apply(PatchOp::Remove, &Path::root(), Value::Null)
            .unwrap_err();
        assert!(matches!(err, StoreError::RootCannotBeRemoved));
        assert_eq!(json(&t), r#"{"a":1}"#);
    }

    #[test]
    fn replace_and_remove_require_existing_path() {
        let mut t = tree(r#"{"a":{"b":1}}"#);
        let err = t
            .apply(PatchOp::Replace, &Path::from(["a", "c"]), Value::from(2))
            .unwrap_err();
        assert!(matches!(err, StoreError::PathNotFound { .. }));
        let err = t
            .apply(PatchOp::Remove, &Path::from(["x", "y"]), Value::Null)
            .unwrap_err();
        match err {
            StoreError::PathNotFound { path } => assert_eq!(path, "/x"),
            other => panic!("unexpected error: {other}"),
        }

        t.apply(PatchOp::Replace, &Path::from(["a", "b"]), Value::from(2))
            .unwrap();
        t.apply(PatchOp::Remove, &Path::from(["a", "b"]), Value::Null)
            .unwrap();
        assert_eq!(json(&t), r#"{"a":{}}"#);
    }

    #[test]
    fn error_paths_escape_slashes_in_keys() {
        let mut t = tree(r#"{"a/b":{}}"#);
        let err = t
            .apply(PatchOp::Remove, &Path::from(["a/b", "x"]), Value::Null)
            .unwrap_err();
        assert_eq!(err.to_string(), "path not found: /a~1b/x");
    }

    #[test]
    fn array_insert_replace_remove_shift() {
        let mut t = tree(r#"{"xs":[1,2,3]}"#);
        t.apply(PatchOp::Add, &Path::from(["xs", "1"]), Value::from(9))
            .unwrap();
        assert_eq!(json(&t), r#"{"xs":[1,9,2,3]}"#);
        t.apply(PatchOp::Replace, &Path::from(["xs", "0"]), Value::from(0))
            .unwrap();
        assert_eq!(json(&t), r#"{"xs":[0,9,2,3]}"#);
        t.apply(PatchOp::Remove, &Path::from(["xs", "1"]), Value::Null)
            .unwrap();
        assert_eq!(json(&t), r#"{"xs":[0,2,3]}"#);
        t.apply(PatchOp::Add, &Path::from(["xs", "-"]), Value::from(4))
            .unwrap();
        t.apply(PatchOp::Add, &Path::from(["xs", "4"]), Value::from(5))
            .unwrap();
        assert_eq!(json(&t), r#"{"xs":[0,2,3,4,5]}"#);
    }

    #[test]
    fn array_index_errors() {
        let mut t = tree(r#"{"xs":[1]}"#);
        let err = t
            .apply(PatchOp::Add, &Path::from(["xs", "3"]), Value::from(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::IndexOutOfRange { .. }));
        let err = t
            .apply(PatchOp::Replace, &Path::from(["xs", "1"]), Value::from(1))
            .unwrap_err();
        assert!(matches!(err, StoreError::IndexOutOfRange { .. }));
        let err = t
            .apply(PatchOp::Remove, &Path::from(["xs", "-"]), Value::Null)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidIndex { .. }));
        let err = t
            .apply(PatchOp::Add, &Path::from(["xs", "foo", "a"]), Value::Null)
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidIndex { .. }));
    }

    #[test]
    fn add_through_scalar_conflicts() {
        let mut t = tree(r#"{"a":1}"#);
        let err = t
            .apply(PatchOp::Add, &Path::from(["a", "b"]), Value::from(2))
            .unwrap_err();
        match err {
            StoreError::PathConflict { path } => assert_eq!(path, "/a"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn lookup_walks_objects_and_arrays() {
        let t = tree(r#"{"a":{"xs":[{"id":7}]}}"#);
        assert_eq!(
            t.lookup(&Path::from(["a", "xs", "0", "id"])),
            Some(&Value::from(7))
        );
        assert!(t.lookup(&Path::from(["a", "xs", "1"])).is_none());
        assert!(t.lookup(&Path::from(["a", "xs", "-"])).is_none());
        assert!(t.lookup(&Path::from(["a", "xs", "0", "id", "z"])).is_none());
        assert_eq!(t.lookup(&Path::root()), Some(t.root()));
    }

    #[test]
    fn make_dir_creates_and_conflicts() {
        let mut t = tree(r#"{"a":{"b":1}}"#);
        t.make_dir(&Path::from(["a", "c", "d"])).unwrap();
        assert_eq!(json(&t), r#"{"a":{"b":1,"c":{"d":{}}}}"#);
        t.make_dir(&Path::from(["a"])).unwrap();
        let err = t.make_dir(&Path::from(["a", "b", "x"])).unwrap_err();
        assert!(matches!(err, StoreError::PathConflict { .. }));
        let err = t.make_dir(&Path::from(["a", "b"])).unwrap_err();
        assert!(matches!(err, StoreError::PathConflict { .. }));
    }

    #[test]
    fn same_ops_same_result() {
        let ops = [
            (PatchOp::Add, Path::from(["z"]), Value::from(1)),
            (PatchOp::Add, Path::from(["a", "b"]), Value::from("x")),
            (PatchOp::Add, Path::from(["m"]), Value::Array(vec![])),
            (PatchOp::Add, Path::from(["m", "-"]), Value::from(true)),
        ];
        let mut first = DataTree::new(Map::new());
        let mut second = DataTree::new(Map::new());
        for (op, path, value) in ops.iter().cloned() {
            first.apply(op, &path, value.clone()).unwrap();
            second.apply(op, &path, value).unwrap();
        }
        assert_eq!(json(&first), json(&second));
    }
}
