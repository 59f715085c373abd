//! Delta Engine (§4.3): applies an ordered sequence of deltas to a JSON value
//! tree, all-or-nothing.

use serde_json::Value;

use crate::error::DeltaError;
use crate::protocol::{Delta, DeltaOp};

/// Applies `deltas` in order to a clone of `tree`, returning the new tree on
/// success. On the first failing delta, the original `tree` is left
/// untouched by virtue of never having been mutated in place.
pub fn apply_deltas(tree: &Value, deltas: &[Delta]) -> Result<Value, DeltaError> {
    let mut working = tree.clone();
    for delta in deltas {
        apply_one(&mut working, delta)?;
    }
    Ok(working)
}

fn apply_one(root: &mut Value, delta: &Delta) -> Result<(), DeltaError> {
    match delta.operation {
        DeltaOp::Set => {
            let value = delta
                .value
                .clone()
                .ok_or_else(|| DeltaError::TypeMismatch {
                    op: "Set".into(),
                    path: path_str(&delta.path),
                })?;
            set_at(root, &delta.path, value)
        }
        DeltaOp::Delete => delete_at(root, &delta.path),
        DeltaOp::Insert => {
            let value = delta
                .value
                .clone()
                .ok_or_else(|| DeltaError::TypeMismatch {
                    op: "Insert".into(),
                    path: path_str(&delta.path),
                })?;
            insert_at(root, &delta.path, value)
        }
        DeltaOp::Push => {
            let value = delta
                .value
                .clone()
                .ok_or_else(|| DeltaError::TypeMismatch {
                    op: "Push".into(),
                    path: path_str(&delta.path),
                })?;
            push_at(root, &delta.path, value)
        }
        DeltaOp::Update => {
            let value = delta
                .value
                .clone()
                .ok_or_else(|| DeltaError::TypeMismatch {
                    op: "Update".into(),
                    path: path_str(&delta.path),
                })?;
            set_at(root, &delta.path, value)
        }
        DeltaOp::Merge => {
            let value = delta
                .value
                .clone()
                .ok_or_else(|| DeltaError::TypeMismatch {
                    op: "Merge".into(),
                    path: path_str(&delta.path),
                })?;
            merge_at(root, &delta.path, value)
        }
    }
}

fn path_str(path: &[String]) -> String {
    format!("/{}", path.join("/"))
}

/// Walks all but the last path segment, returning a mutable reference to the
/// parent container plus the final segment, or an error if any intermediate
/// segment does not resolve.
fn resolve_parent<'a>(
    root: &'a mut Value,
    path: &'a [String],
) -> Result<(&'a mut Value, &'a str), DeltaError> {
    if path.is_empty() {
        return Err(DeltaError::PathNotFound("/".into()));
    }
    let (last, init) = path.split_last().unwrap();
    let mut cur = root;
    for (i, seg) in init.iter().enumerate() {
        cur = step(cur, seg).ok_or_else(|| DeltaError::PathNotFound(path_str(&path[..=i])))?;
    }
    Ok((cur, last))
}

fn step<'a>(node: &'a mut Value, seg: &str) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => map.get_mut(seg),
        Value::Array(arr) => seg.parse::<usize>().ok().and_then(move |i| arr.get_mut(i)),
        _ => None,
    }
}

/// Walks every segment of `path`, returning a mutable reference to the node
/// the full path resolves to. Used by ops (`Push`, `Merge`) that act on the
/// addressed node itself rather than on its parent container.
fn resolve_at<'a>(root: &'a mut Value, path: &'a [String]) -> Result<&'a mut Value, DeltaError> {
    let mut cur = root;
    for (i, seg) in path.iter().enumerate() {
        cur = step(cur, seg).ok_or_else(|| DeltaError::PathNotFound(path_str(&path[..=i])))?;
    }
    Ok(cur)
}

fn set_at(root: &mut Value, path: &[String], value: Value) -> Result<(), DeltaError> {
    if path.is_empty() {
        *root = value;
        return Ok(());
    }
    let (parent, last) = resolve_parent(root, path)?;
    match parent {
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        Value::Array(arr) => {
            let idx: usize = last
                .parse()
                .map_err(|_| DeltaError::TypeMismatch {
                    op: "Set".into(),
                    path: path_str(path),
                })?;
            if idx >= arr.len() {
                return Err(DeltaError::IndexOutOfBounds {
                    path: path_str(path),
                    index: idx as i64,
                });
            }
            arr[idx] = value;
            Ok(())
        }
        _ => Err(DeltaError::TypeMismatch {
            op: "Set".into(),
            path: path_str(path),
        }),
    }
}

fn delete_at(root: &mut Value, path: &[String]) -> Result<(), DeltaError> {
    let (parent, last) = resolve_parent(root, path)?;
    match parent {
        Value::Object(map) => {
            if map.remove(last).is_none() {
                return Err(DeltaError::PathNotFound(path_str(path)));
            }
            Ok(())
        }
        Value::Array(arr) => {
            let idx: usize = last
                .parse()
                .map_err(|_| DeltaError::TypeMismatch {
                    op: "Delete".into(),
                    path: path_str(path),
                })?;
            if idx >= arr.len() {
                return Err(DeltaError::IndexOutOfBounds {
                    path: path_str(path),
                    index: idx as i64,
                });
            }
            arr.remove(idx);
            Ok(())
        }
        _ => Err(DeltaError::TypeMismatch {
            op: "Delete".into(),
            path: path_str(path),
        }),
    }
}

fn insert_at(root: &mut Value, path: &[String], value: Value) -> Result<(), DeltaError> {
    let (parent, last) = resolve_parent(root, path)?;
    match parent {
        Value::Array(arr) => {
            let idx: usize = last
                .parse()
                .map_err(|_| DeltaError::TypeMismatch {
                    op: "Insert".into(),
                    path: path_str(path),
                })?;
            if idx > arr.len() {
                return Err(DeltaError::IndexOutOfBounds {
                    path: path_str(path),
                    index: idx as i64,
                });
            }
            arr.insert(idx, value);
            Ok(())
        }
        Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        _ => Err(DeltaError::TypeMismatch {
            op: "Insert".into(),
            path: path_str(path),
        }),
    }
}

fn push_at(root: &mut Value, path: &[String], value: Value) -> Result<(), DeltaError> {
    let target = resolve_at(root, path)?;
    match target {
        Value::Array(arr) => {
            arr.push(value);
            Ok(())
        }
        _ => Err(DeltaError::TypeMismatch {
            op: "Push".into(),
            path: path_str(path),
        }),
    }
}

fn merge_at(root: &mut Value, path: &[String], value: Value) -> Result<(), DeltaError> {
    let target = resolve_at(root, path)?;
    match (target, value) {
        (Value::Object(dst), Value::Object(src)) => {
            for (k, v) in src {
                dst.insert(k, v);
            }
            Ok(())
        }
        _ => Err(DeltaError::TypeMismatch {
            op: "Merge".into(),
            path: path_str(path),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn delta(op: DeltaOp, path: &[&str], value: Option<Value>) -> Delta {
        Delta {
            operation: op,
            path: path.iter().map(|s| s.to_string()).collect(),
            value,
        }
    }

    #[test]
    fn empty_sequence_is_identity() {
        let tree = json!({"a": 1, "b": [1, 2, 3]});
        let result = apply_deltas(&tree, &[]).unwrap();
        assert_eq!(result, tree);
    }

    #[test]
    fn set_replaces_nested_value() {
        let tree = json!({"a": {"b": 1}});
        let deltas = vec![delta(DeltaOp::Set, &["a", "b"], Some(json!(2)))];
        let result = apply_deltas(&tree, &deltas).unwrap();
        assert_eq!(result, json!({"a": {"b": 2}}));
    }

    #[test]
    fn set_root_replaces_whole_tree() {
        let tree = json!({"a": 1});
        let deltas = vec![delta(DeltaOp::Set, &[], Some(json!({"z": 9})))];
        let result = apply_deltas(&tree, &deltas).unwrap();
        assert_eq!(result, json!({"z": 9}));
    }

    #[test]
    fn push_appends_to_array() {
        let tree = json!({"list": [1, 2]});
        let deltas = vec![delta(DeltaOp::Push, &["list"], Some(json!(3)))];
        let result = apply_deltas(&tree, &deltas).unwrap();
        assert_eq!(result, json!({"list": [1, 2, 3]}));
    }

    #[test]
    fn delete_removes_array_element() {
        let tree = json!({"list": [1, 2, 3]});
        let deltas = vec![delta(DeltaOp::Delete, &["list", "1"], None)];
        let result = apply_deltas(&tree, &deltas).unwrap();
        assert_eq!(result, json!({"list": [1, 3]}));
    }

    #[test]
    fn unresolvable_path_fails_and_preserves_original() {
        let tree = json!({"a": 1});
        let deltas = vec![delta(DeltaOp::Set, &["missing", "x"], Some(json!(1)))];
        let err = apply_deltas(&tree, &deltas).unwrap_err();
        assert!(matches!(err, DeltaError::PathNotFound(_)));
    }

    #[test]
    fn out_of_bounds_index_fails() {
        let tree = json!({"list": [1, 2]});
        let deltas = vec![delta(DeltaOp::Set, &["list", "5"], Some(json!(9)))];
        let err = apply_deltas(&tree, &deltas).unwrap_err();
        assert!(matches!(err, DeltaError::IndexOutOfBounds { .. }));
    }

    #[test]
    fn sequence_is_all_or_nothing() {
        let tree = json!({"a": 1, "list": [1, 2]});
        let deltas = vec![
            delta(DeltaOp::Set, &["a"], Some(json!(2))),
            delta(DeltaOp::Set, &["list", "50"], Some(json!(9))),
        ];
        let err = apply_deltas(&tree, &deltas);
        assert!(err.is_err());
        // original `tree` binding untouched -- apply_deltas never mutates its input.
        assert_eq!(tree, json!({"a": 1, "list": [1, 2]}));
    }

    #[test]
    fn merge_combines_objects() {
        let tree = json!({"obj": {"a": 1}});
        let deltas = vec![delta(DeltaOp::Merge, &["obj"], Some(json!({"b": 2})))];
        let result = apply_deltas(&tree, &deltas).unwrap();
        assert_eq!(result, json!({"obj": {"a": 1, "b": 2}}));
    }
}
