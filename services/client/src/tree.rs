//! The channel tree: a two-level graph of categories and channels behind a
//! virtual root, arena-allocated with index links so parent/child references
//! never form ownership cycles.
//!
//! The `FlatList` is the rendering source; it is rebuilt whenever the
//! structure or the collapsed set changes.

use std::collections::{HashMap, HashSet};

use concord_protocol::{Channel, ChannelId, ChannelKind};

const ROOT: usize = 0;

#[derive(Debug)]
struct Node {
    /// None only for the virtual root.
    channel: Option<Channel>,
    parent: usize,
    children: Vec<usize>,
}

/// One renderable row of the flattened tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatEntry {
    pub channel_id: ChannelId,
    pub depth: usize,
    pub is_category: bool,
    pub collapsed: bool,
}

#[derive(Debug)]
pub struct ChannelTree {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    /// O(1) id → arena index.
    map: HashMap<ChannelId, usize>,
    collapsed: HashSet<ChannelId>,
    flat: Vec<FlatEntry>,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("duplicate channel id")]
    Duplicate,
    #[error("unknown channel id")]
    Unknown,
}

impl Default for ChannelTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node { channel: None, parent: ROOT, children: Vec::new() })],
            free: Vec::new(),
            map: HashMap::new(),
            collapsed: HashSet::new(),
            flat: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, id: ChannelId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn get(&self, id: ChannelId) -> Option<&Channel> {
        let index = *self.map.get(&id)?;
        self.nodes[index].as_ref()?.channel.as_ref()
    }

    /// The rendering source, in tree order.
    pub fn flat_list(&self) -> &[FlatEntry] {
        &self.flat
    }

    /// Insert a channel. Duplicates are rejected; a leaf referencing an
    /// unknown or non-category parent lands at the root instead of failing.
    pub fn add(&mut self, channel: Channel) -> Result<(), TreeError> {
        if self.map.contains_key(&channel.id) {
            return Err(TreeError::Duplicate);
        }
        let parent = self.resolve_parent(&channel);
        let id = channel.id;
        let index = self.alloc(Node { channel: Some(channel), parent, children: Vec::new() });
        self.node_mut(parent).children.push(index);
        self.map.insert(id, index);
        self.rebuild();
        Ok(())
    }

    /// Apply an updated channel record. A changed `category_id` detaches the
    /// node from its old parent and attaches it to the new one (or the root
    /// when the category is unknown).
    pub fn update(&mut self, channel: Channel) -> Result<(), TreeError> {
        let index = *self.map.get(&channel.id).ok_or(TreeError::Unknown)?;
        let new_parent = self.resolve_parent(&channel);
        let old_parent = self.node(index).parent;
        if new_parent != old_parent {
            self.node_mut(old_parent).children.retain(|&c| c != index);
            self.node_mut(new_parent).children.push(index);
            self.node_mut(index).parent = new_parent;
        }
        self.node_mut(index).channel = Some(channel);
        self.rebuild();
        Ok(())
    }

    /// Remove a node; a category takes all of its children with it.
    pub fn remove(&mut self, id: ChannelId) -> Result<(), TreeError> {
        let index = *self.map.get(&id).ok_or(TreeError::Unknown)?;
        let parent = self.node(index).parent;
        self.node_mut(parent).children.retain(|&c| c != index);
        self.remove_subtree(index);
        self.rebuild();
        Ok(())
    }

    pub fn set_collapsed(&mut self, id: ChannelId, collapsed: bool) {
        let changed = if collapsed {
            self.collapsed.insert(id)
        } else {
            self.collapsed.remove(&id)
        };
        if changed {
            self.rebuild();
        }
    }

    pub fn is_collapsed(&self, id: ChannelId) -> bool {
        self.collapsed.contains(&id)
    }

    /// Structural invariant check used by tests: every leaf's category
    /// either exists as a category node or the leaf hangs off the root.
    pub fn is_consistent(&self) -> bool {
        self.map.iter().all(|(id, &index)| {
            let Some(node) = self.nodes[index].as_ref() else {
                return false;
            };
            let Some(channel) = node.channel.as_ref() else {
                return false;
            };
            if channel.id != *id {
                return false;
            }
            match node.parent {
                ROOT => true,
                parent => self.nodes[parent]
                    .as_ref()
                    .and_then(|p| p.channel.as_ref())
                    .is_some_and(|c| c.kind == ChannelKind::Category),
            }
        })
    }

    // -- internals -----------------------------------------------------------

    fn resolve_parent(&self, channel: &Channel) -> usize {
        if channel.kind == ChannelKind::Category {
            return ROOT;
        }
        channel
            .category_id
            .and_then(|cat| self.map.get(&cat).copied())
            .filter(|&idx| {
                self.nodes[idx]
                    .as_ref()
                    .and_then(|n| n.channel.as_ref())
                    .is_some_and(|c| c.kind == ChannelKind::Category)
            })
            .unwrap_or(ROOT)
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(index) = self.free.pop() {
            self.nodes[index] = Some(node);
            index
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn node(&self, index: usize) -> &Node {
        self.nodes[index].as_ref().expect("live node")
    }

    fn node_mut(&mut self, index: usize) -> &mut Node {
        self.nodes[index].as_mut().expect("live node")
    }

    fn remove_subtree(&mut self, index: usize) {
        let node = self.nodes[index].take().expect("live node");
        if let Some(channel) = &node.channel {
            self.map.remove(&channel.id);
            self.collapsed.remove(&channel.id);
        }
        for child in node.children {
            self.remove_subtree(child);
        }
        self.free.push(index);
    }

    fn rebuild(&mut self) {
        let mut flat = Vec::with_capacity(self.map.len());
        let mut order: Vec<usize> = self.node(ROOT).children.clone();
        self.sort_siblings(&mut order);
        for index in order {
            self.flatten_into(index, 0, &mut flat);
        }
        self.flat = flat;
    }

    fn flatten_into(&self, index: usize, depth: usize, flat: &mut Vec<FlatEntry>) {
        let node = self.node(index);
        let Some(channel) = node.channel.as_ref() else {
            return;
        };
        let is_category = channel.kind == ChannelKind::Category;
        let collapsed = is_category && self.collapsed.contains(&channel.id);
        flat.push(FlatEntry { channel_id: channel.id, depth, is_category, collapsed });
        if collapsed {
            return;
        }
        let mut children = node.children.clone();
        self.sort_siblings(&mut children);
        for child in children {
            self.flatten_into(child, depth + 1, flat);
        }
    }

    fn sort_siblings(&self, siblings: &mut [usize]) {
        siblings.sort_by(|&a, &b| {
            let a = self.node(a).channel.as_ref();
            let b = self.node(b).channel.as_ref();
            match (a, b) {
                (Some(a), Some(b)) => a
                    .position
                    .cmp(&b.position)
                    .then_with(|| a.name.cmp(&b.name)),
                _ => std::cmp::Ordering::Equal,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn channel(name: &str, kind: ChannelKind, category_id: Option<ChannelId>, position: i32) -> Channel {
        Channel {
            id: Uuid::new_v4(),
            server_id: Uuid::new_v4(),
            name: name.to_owned(),
            kind,
            category_id,
            position,
            topic: None,
        }
    }

    #[test]
    fn add_rejects_duplicates_and_orphans_land_at_root() {
        let mut tree = ChannelTree::new();
        let general = channel("general", ChannelKind::Text, None, 0);
        tree.add(general.clone()).unwrap();
        assert_eq!(tree.add(general.clone()), Err(TreeError::Duplicate));

        // Unknown category: orphan-safe, re-parented to root.
        let orphan = channel("orphan", ChannelKind::Text, Some(Uuid::new_v4()), 1);
        tree.add(orphan.clone()).unwrap();
        assert!(tree.is_consistent());
        let flat = tree.flat_list();
        assert_eq!(flat.len(), 2);
        assert!(flat.iter().all(|e| e.depth == 0));
    }

    #[test]
    fn leaves_nest_under_their_category_in_the_flat_list() {
        let mut tree = ChannelTree::new();
        let category = channel("Voice", ChannelKind::Category, None, 0);
        let leaf = channel("lobby", ChannelKind::Voice, Some(category.id), 0);
        let top = channel("general", ChannelKind::Text, None, 1);
        tree.add(category.clone()).unwrap();
        tree.add(leaf.clone()).unwrap();
        tree.add(top.clone()).unwrap();

        let flat = tree.flat_list();
        assert_eq!(
            flat.iter().map(|e| (e.channel_id, e.depth)).collect::<Vec<_>>(),
            vec![(category.id, 0), (leaf.id, 1), (top.id, 0)]
        );
        assert!(tree.is_consistent());
    }

    #[test]
    fn collapsing_a_category_hides_its_children_from_the_flat_list() {
        let mut tree = ChannelTree::new();
        let category = channel("Text", ChannelKind::Category, None, 0);
        let leaf = channel("general", ChannelKind::Text, Some(category.id), 0);
        tree.add(category.clone()).unwrap();
        tree.add(leaf).unwrap();
        assert_eq!(tree.flat_list().len(), 2);

        tree.set_collapsed(category.id, true);
        let flat = tree.flat_list();
        assert_eq!(flat.len(), 1);
        assert!(flat[0].collapsed);

        tree.set_collapsed(category.id, false);
        assert_eq!(tree.flat_list().len(), 2);
    }

    #[test]
    fn update_reparents_across_categories_and_falls_back_to_root() {
        let mut tree = ChannelTree::new();
        let cat_a = channel("A", ChannelKind::Category, None, 0);
        let cat_b = channel("B", ChannelKind::Category, None, 1);
        let mut leaf = channel("general", ChannelKind::Text, Some(cat_a.id), 0);
        tree.add(cat_a.clone()).unwrap();
        tree.add(cat_b.clone()).unwrap();
        tree.add(leaf.clone()).unwrap();

        leaf.category_id = Some(cat_b.id);
        tree.update(leaf.clone()).unwrap();
        let flat = tree.flat_list();
        let b_pos = flat.iter().position(|e| e.channel_id == cat_b.id).unwrap();
        assert_eq!(flat[b_pos + 1].channel_id, leaf.id);
        assert_eq!(flat[b_pos + 1].depth, 1);

        // Failed category lookup attaches to root.
        leaf.category_id = Some(Uuid::new_v4());
        tree.update(leaf.clone()).unwrap();
        let entry = tree
            .flat_list()
            .iter()
            .find(|e| e.channel_id == leaf.id)
            .cloned()
            .unwrap();
        assert_eq!(entry.depth, 0);
        assert!(tree.is_consistent());
    }

    #[test]
    fn removing_a_category_removes_its_children_first() {
        let mut tree = ChannelTree::new();
        let category = channel("Stuff", ChannelKind::Category, None, 0);
        let leaf_a = channel("a", ChannelKind::Text, Some(category.id), 0);
        let leaf_b = channel("b", ChannelKind::Text, Some(category.id), 1);
        tree.add(category.clone()).unwrap();
        tree.add(leaf_a.clone()).unwrap();
        tree.add(leaf_b.clone()).unwrap();
        assert_eq!(tree.len(), 3);

        tree.remove(category.id).unwrap();
        assert!(tree.is_empty());
        assert!(!tree.contains(leaf_a.id));
        assert!(!tree.contains(leaf_b.id));
        assert!(tree.flat_list().is_empty());
        assert_eq!(tree.remove(category.id), Err(TreeError::Unknown));
    }

    #[test]
    fn arena_slots_are_reused_after_removal() {
        let mut tree = ChannelTree::new();
        let a = channel("a", ChannelKind::Text, None, 0);
        tree.add(a.clone()).unwrap();
        let before = tree.nodes.len();
        tree.remove(a.id).unwrap();
        let b = channel("b", ChannelKind::Text, None, 0);
        tree.add(b).unwrap();
        assert_eq!(tree.nodes.len(), before);
    }

    #[test]
    fn siblings_order_by_position_then_name() {
        let mut tree = ChannelTree::new();
        let z = channel("zeta", ChannelKind::Text, None, 0);
        let a = channel("alpha", ChannelKind::Text, None, 0);
        let last = channel("aaa-but-later", ChannelKind::Text, None, 5);
        tree.add(z.clone()).unwrap();
        tree.add(a.clone()).unwrap();
        tree.add(last.clone()).unwrap();

        let order: Vec<ChannelId> = tree.flat_list().iter().map(|e| e.channel_id).collect();
        assert_eq!(order, vec![a.id, z.id, last.id]);
    }
}
