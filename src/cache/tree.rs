//! Tree builder
//!
//! Turns a flat enumeration of items into one rooted tree. Parent links are
//! resolved against the fully buffered enumeration, so memory is
//! O(item count) per generation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use anyhow::Result;
use futures_util::stream::{BoxStream, StreamExt};
use tracing::{debug, info};

use crate::item::{Item, ROOT_ID};

/// Consume the whole enumeration, then assemble the tree.
///
/// `progress` is bumped once per received item so callers can report how
/// far a running generation has got.
pub async fn build(mut items: BoxStream<'_, Result<Item>>, progress: &AtomicI64) -> Result<Item> {
    let mut buffered = Vec::new();
    while let Some(item) = items.next().await {
        buffered.push(item?);
        progress.fetch_add(1, Ordering::Relaxed);
    }
    info!(count = buffered.len(), "Enumeration complete, assembling tree");
    Ok(assemble(buffered))
}

/// Assemble a flat list into a tree under a synthetic root.
///
/// Items whose parent is missing, is themselves, or who sit on a parent
/// cycle are attached to the root. Later duplicates of an id replace
/// earlier ones.
pub fn assemble(items: Vec<Item>) -> Item {
    let mut order: Vec<String> = Vec::with_capacity(items.len());
    let mut by_id: HashMap<String, Item> = HashMap::with_capacity(items.len());
    for item in items {
        if item.id == ROOT_ID {
            continue;
        }
        if !by_id.contains_key(&item.id) {
            order.push(item.id.clone());
        }
        by_id.insert(item.id.clone(), item);
    }

    // Resolve every parent, falling back to the root
    let mut children_of: HashMap<String, Vec<String>> = HashMap::new();
    let mut parent_of: HashMap<&str, String> = HashMap::with_capacity(order.len());
    for id in &order {
        let parent = by_id
            .get(id)
            .and_then(|item| item.parent_id.as_deref())
            .filter(|p| !p.is_empty() && *p != id.as_str() && by_id.contains_key(*p))
            .unwrap_or(ROOT_ID)
            .to_string();
        children_of.entry(parent.clone()).or_default().push(id.clone());
        parent_of.insert(id.as_str(), parent);
    }

    // Anything unreachable from the root sits on a cycle; cut it loose
    let mut reachable = reach(ROOT_ID, &children_of, HashSet::new());
    let mut orphaned = 0;
    for id in &order {
        if reachable.contains(id) {
            continue;
        }
        if let Some(siblings) = parent_of
            .get(id.as_str())
            .and_then(|parent| children_of.get_mut(parent))
        {
            siblings.retain(|c| c != id);
        }
        parent_of.insert(id.as_str(), ROOT_ID.to_string());
        children_of.entry(ROOT_ID.to_string()).or_default().push(id.clone());
        reachable = reach(id, &children_of, reachable);
        orphaned += 1;
    }
    if orphaned > 0 {
        debug!(count = orphaned, "Broke parent cycles by attaching to root");
    }

    // Build bottom-up: every child is finished before its parent takes it
    let bfs = bfs_order(&children_of);
    let mut built: HashMap<String, Item> = HashMap::with_capacity(bfs.len());
    for id in bfs.iter().rev() {
        let mut node = if id == ROOT_ID {
            Item::root()
        } else {
            match by_id.remove(id) {
                Some(item) => item,
                None => continue,
            }
        };
        if let Some(child_ids) = children_of.get(id) {
            let children: Vec<Item> = child_ids.iter().filter_map(|c| built.remove(c)).collect();
            if !children.is_empty() {
                node.children = Some(children);
            }
        }
        built.insert(id.clone(), node);
    }

    built.remove(ROOT_ID).unwrap_or_else(Item::root)
}

/// Mark everything reachable from `start`
fn reach(
    start: &str,
    children_of: &HashMap<String, Vec<String>>,
    mut seen: HashSet<String>,
) -> HashSet<String> {
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(children) = children_of.get(&id) {
            queue.extend(children.iter().cloned());
        }
    }
    seen
}

fn bfs_order(children_of: &HashMap<String, Vec<String>>) -> Vec<String> {
    let mut out = Vec::new();
    let mut queue = VecDeque::from([ROOT_ID.to_string()]);
    while let Some(id) = queue.pop_front() {
        if let Some(children) = children_of.get(&id) {
            queue.extend(children.iter().cloned());
        }
        out.push(id);
    }
    out
}
