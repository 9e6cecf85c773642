//! Reading and building PDF name trees (PDF 32000-1 §7.9.6).

use std::collections::{BTreeMap, HashSet};

use tracing::warn;

use crate::document::Document;
use crate::object::{Dictionary, Object, ObjectId, StringFormat};
use crate::{AttachError, Result};

/// Leaves and intermediate nodes hold at most this many entries.
pub(crate) const MAX_NODE_ENTRIES: usize = 32;
const MAX_TREE_DEPTH: usize = 32;

/// Flatten the tree rooted at `root` into a sorted key → value map.
///
/// Values are returned as stored (usually references to file
/// specifications). A key that appears twice keeps its last value.
pub(crate) fn collect_entries(doc: &Document, root: &Object) -> Result<BTreeMap<Vec<u8>, Object>> {
    let mut out = BTreeMap::new();
    let mut visited = HashSet::new();
    walk(doc, root, 0, &mut visited, &mut out)?;
    Ok(out)
}

fn walk(
    doc: &Document,
    node: &Object,
    depth: usize,
    visited: &mut HashSet<ObjectId>,
    out: &mut BTreeMap<Vec<u8>, Object>,
) -> Result<()> {
    if depth > MAX_TREE_DEPTH {
        return Err(AttachError::MalformedDocument("name tree nested too deeply".into()));
    }
    if let Object::Reference(id) = node {
        if !visited.insert(*id) {
            warn!(
                domain = "pdf.name_tree",
                kind = "name_tree_cycle",
                obj = id.0,
                "Name tree node visited twice"
            );
            return Ok(());
        }
    }
    let dict = match doc.resolve(node)? {
        Object::Dictionary(d) => d,
        other => {
            return Err(AttachError::MalformedDocument(format!(
                "name tree node is a {}, expected a dictionary",
                other.type_name()
            )))
        }
    };

    if let Some(names) = dict.get(b"Names") {
        let names = doc.resolve(names)?.as_array().ok_or_else(|| {
            AttachError::MalformedDocument("name tree /Names is not an array".into())
        })?;
        if names.len() % 2 == 1 {
            warn!(
                domain = "pdf.name_tree",
                kind = "odd_names_array",
                len = names.len(),
                "Ignoring trailing key without value"
            );
        }
        for pair in names.chunks_exact(2) {
            match doc.resolve(&pair[0])? {
                Object::String(key, _) => {
                    out.insert(key.clone(), pair[1].clone());
                }
                other => {
                    warn!(
                        domain = "pdf.name_tree",
                        kind = "non_string_key",
                        found = other.type_name(),
                        "Skipping name tree entry"
                    );
                }
            }
        }
    }

    if let Some(kids) = dict.get(b"Kids") {
        let kids = doc.resolve(kids)?.as_array().ok_or_else(|| {
            AttachError::MalformedDocument("name tree /Kids is not an array".into())
        })?;
        for kid in kids {
            walk(doc, kid, depth + 1, visited, out)?;
        }
    }
    Ok(())
}

/// Write `entries` as a new name tree and return the root object id.
///
/// Small trees are a single root with `/Names`. Larger ones are split into
/// leaves with `/Limits`, grouped under intermediate nodes as needed. Keys
/// come out of the `BTreeMap` sorted, which is the order every node requires.
pub(crate) fn build(doc: &mut Document, entries: BTreeMap<Vec<u8>, Object>) -> Result<ObjectId> {
    if entries.len() <= MAX_NODE_ENTRIES {
        let root = Dictionary::from_iter([("Names", Object::Array(flatten(&entries)))]);
        return doc.add_object(root);
    }

    let pairs: Vec<(Vec<u8>, Object)> = entries.into_iter().collect();
    let mut level: Vec<(Vec<u8>, Vec<u8>, ObjectId)> = pairs
        .chunks(MAX_NODE_ENTRIES)
        .map(|chunk| {
            let (first, last) = (chunk[0].0.clone(), chunk[chunk.len() - 1].0.clone());
            let mut names = Vec::with_capacity(chunk.len() * 2);
            for (key, value) in chunk {
                names.push(Object::String(key.clone(), StringFormat::Literal));
                names.push(value.clone());
            }
            let leaf = Dictionary::from_iter([
                ("Limits", limits(&first, &last)),
                ("Names", Object::Array(names)),
            ]);
            Ok((first, last, doc.add_object(leaf)?))
        })
        .collect::<Result<_>>()?;

    while level.len() > MAX_NODE_ENTRIES {
        level = level
            .chunks(MAX_NODE_ENTRIES)
            .map(|chunk| {
                let first = chunk[0].0.clone();
                let last = chunk[chunk.len() - 1].1.clone();
                let node = Dictionary::from_iter([
                    ("Limits", limits(&first, &last)),
                    ("Kids", kids(chunk)),
                ]);
                Ok((first, last, doc.add_object(node)?))
            })
            .collect::<Result<_>>()?;
    }

    let root = Dictionary::from_iter([("Kids", kids(&level))]);
    doc.add_object(root)
}

/// Number of objects [`build`] allocates for a tree of `entries` keys.
pub(crate) fn node_count(entries: usize) -> usize {
    if entries <= MAX_NODE_ENTRIES {
        return 1;
    }
    let mut level = (entries + MAX_NODE_ENTRIES - 1) / MAX_NODE_ENTRIES;
    let mut total = level;
    while level > MAX_NODE_ENTRIES {
        level = (level + MAX_NODE_ENTRIES - 1) / MAX_NODE_ENTRIES;
        total += level;
    }
    total + 1
}

fn flatten(entries: &BTreeMap<Vec<u8>, Object>) -> Vec<Object> {
    entries
        .iter()
        .flat_map(|(key, value)| {
            [Object::String(key.clone(), StringFormat::Literal), value.clone()]
        })
        .collect()
}

fn limits(first: &[u8], last: &[u8]) -> Object {
    Object::Array(vec![
        Object::String(first.to_vec(), StringFormat::Literal),
        Object::String(last.to_vec(), StringFormat::Literal),
    ])
}

fn kids(nodes: &[(Vec<u8>, Vec<u8>, ObjectId)]) -> Object {
    Object::Array(nodes.iter().map(|(_, _, id)| Object::Reference(*id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(n: usize) -> BTreeMap<Vec<u8>, Object> {
        (0..n)
            .map(|i| (format!("file-{i:04}.txt").into_bytes(), Object::Integer(i as i64)))
            .collect()
    }

    #[test]
    fn small_tree_is_single_sorted_node() {
        let mut doc = Document::new();
        let mut map = BTreeMap::new();
        map.insert(b"zeta".to_vec(), Object::Integer(1));
        map.insert(b"alpha".to_vec(), Object::Integer(2));
        let root = build(&mut doc, map).unwrap();

        let dict = doc.get_dict(root).unwrap();
        assert!(!dict.has(b"Limits"));
        let names = dict.get(b"Names").unwrap().as_array().unwrap();
        assert_eq!(names[0].as_str(), Some(&b"alpha"[..]));
        assert_eq!(names[2].as_str(), Some(&b"zeta"[..]));
    }

    #[test]
    fn large_tree_round_trips_with_sorted_limits() {
        let mut doc = Document::new();
        let root = build(&mut doc, entries(2000)).unwrap();

        let collected = collect_entries(&doc, &Object::Reference(root)).unwrap();
        assert_eq!(collected, entries(2000));

        let root_dict = doc.get_dict(root).unwrap();
        assert!(!root_dict.has(b"Limits"));
        let kids = root_dict.get(b"Kids").unwrap().as_array().unwrap();
        assert!(kids.len() <= MAX_NODE_ENTRIES);

        let mut previous_last: Option<Vec<u8>> = None;
        for kid in kids {
            let kid = doc.get_dict(kid.as_reference().unwrap()).unwrap();
            let limits = kid.get(b"Limits").unwrap().as_array().unwrap();
            let (first, last) = (limits[0].as_str().unwrap(), limits[1].as_str().unwrap());
            assert!(first <= last);
            if let Some(prev) = &previous_last {
                assert!(prev.as_slice() < first);
            }
            previous_last = Some(last.to_vec());
        }
    }

    #[test]
    fn node_count_matches_allocations() {
        for n in [0, 1, MAX_NODE_ENTRIES, MAX_NODE_ENTRIES + 1, 1100, 40_000] {
            let mut doc = Document::new();
            build(&mut doc, entries(n)).unwrap();
            assert_eq!(doc.object_count(), node_count(n), "{n} entries");
        }
    }

    #[test]
    fn cycles_do_not_loop_forever() {
        let mut doc = Document::new();
        let id = doc.add_object(Object::Null).unwrap();
        doc.set_object(
            id,
            Dictionary::from_iter([
                ("Names", Object::Array(vec![Object::string_literal("a"), Object::Integer(1)])),
                ("Kids", Object::Array(vec![Object::Reference(id)])),
            ]),
        );
        let collected = collect_entries(&doc, &Object::Reference(id)).unwrap();
        assert_eq!(collected.len(), 1);
    }
}
