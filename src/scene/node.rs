//! Transform-node arena
//!
//! Loaded models mirror their source hierarchy into this arena 1:1. Nodes are
//! addressed by `NodeId` index handles; bone lists elsewhere store `NodeId`s
//! into the same arena, so a joint referenced by both the hierarchy and a
//! draw batch is one node, not two aliased pointers.

use glam::Mat4;

/// Index handle into a [`NodeArena`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    /// Transform relative to the parent node
    pub local_transform: Mat4,
    /// Parent's world transform × local transform; valid after
    /// [`NodeArena::update_world_transforms`]
    pub world_transform: Mat4,
    /// Inverse bind matrix when this node is a skeleton joint
    pub offset_matrix: Mat4,
}

#[derive(Debug, Default)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn add(&mut self, name: impl Into<String>, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            name: name.into(),
            parent,
            children: Vec::new(),
            local_transform: Mat4::IDENTITY,
            world_transform: Mat4::IDENTITY,
            offset_matrix: Mat4::IDENTITY,
        });
        if let Some(parent) = parent {
            self.nodes[parent.0 as usize].children.push(id);
        }
        id
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Recompute world transforms top-down from `root`. Iterative to survive
    /// arbitrarily deep hierarchies.
    pub fn update_world_transforms(&mut self, root: NodeId, parent_world: Mat4) {
        let mut stack = vec![(root, parent_world)];
        while let Some((id, parent_world)) = stack.pop() {
            let node = &mut self.nodes[id.0 as usize];
            node.world_transform = parent_world * node.local_transform;
            let world = node.world_transform;
            for &child in &self.nodes[id.0 as usize].children {
                stack.push((child, world));
            }
        }
    }

    /// Find a node by name under `root`, depth-first.
    pub fn find(&self, root: NodeId, name: &str) -> Option<NodeId> {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0 as usize];
            if node.name == name {
                return Some(id);
            }
            stack.extend(node.children.iter().copied());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn assert_mat4_eq(a: Mat4, b: Mat4) {
        for (x, y) in a.to_cols_array().iter().zip(b.to_cols_array().iter()) {
            assert!((x - y).abs() < 1e-5, "matrices differ: {a:?} vs {b:?}");
        }
    }

    #[test]
    fn world_transform_is_parent_times_local() {
        let mut arena = NodeArena::new();
        let root = arena.add("root", None);
        let child = arena.add("child", Some(root));
        let grandchild = arena.add("grandchild", Some(child));

        arena.get_mut(root).local_transform = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
        arena.get_mut(child).local_transform = Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0));
        arena.get_mut(grandchild).local_transform =
            Mat4::from_scale(Vec3::new(2.0, 2.0, 2.0));

        arena.update_world_transforms(root, Mat4::IDENTITY);

        for id in [child, grandchild] {
            let node = arena.get(id);
            let parent_world = arena.get(node.parent.unwrap()).world_transform;
            assert_mat4_eq(node.world_transform, parent_world * node.local_transform);
        }
    }

    #[test]
    fn mutation_then_update_propagates() {
        let mut arena = NodeArena::new();
        let root = arena.add("root", None);
        let child = arena.add("child", Some(root));
        arena.update_world_transforms(root, Mat4::IDENTITY);
        assert_mat4_eq(arena.get(child).world_transform, Mat4::IDENTITY);

        arena.get_mut(root).local_transform = Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0));
        arena.update_world_transforms(root, Mat4::IDENTITY);

        assert_mat4_eq(
            arena.get(child).world_transform,
            Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0)),
        );
    }

    #[test]
    fn deep_chain_does_not_recurse() {
        let mut arena = NodeArena::new();
        let root = arena.add("n0", None);
        let mut parent = root;
        for i in 1..20_000 {
            let id = arena.add(format!("n{i}"), Some(parent));
            arena.get_mut(id).local_transform =
                Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
            parent = id;
        }

        arena.update_world_transforms(root, Mat4::IDENTITY);

        let leaf = arena.get(parent);
        let expected = Mat4::from_translation(Vec3::new(19_999.0, 0.0, 0.0));
        assert_mat4_eq(leaf.world_transform, expected);
    }

    #[test]
    fn find_walks_the_whole_tree() {
        let mut arena = NodeArena::new();
        let root = arena.add("root", None);
        let left = arena.add("left", Some(root));
        arena.add("right", Some(root));
        let target = arena.add("target", Some(left));

        assert_eq!(arena.find(root, "target"), Some(target));
        assert_eq!(arena.find(root, "missing"), None);
    }
}
