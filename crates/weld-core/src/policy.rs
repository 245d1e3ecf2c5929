//! Policy (rack) tree
//!
//! Policies form a tree through parent links. `None` is "no policy",
//! the unscoped root that only services apply to.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Policy rack id
pub type PolicyId = u64;

/// Policy tree collaborator
pub trait PolicyManager: Send + Sync {
    /// Parent of `policy_id`, `None` at a root
    fn parent_policy_id(&self, policy_id: PolicyId) -> Option<PolicyId>;

    /// Number of generations between `child_id` and its ancestor `parent_id`
    ///
    /// 0 if equal, 1 for the direct parent, 2 for the grandparent and so
    /// on; -1 if `parent_id` is not an ancestor of `child_id`.
    fn policy_generation_diff(&self, child_id: Option<PolicyId>, parent_id: Option<PolicyId>) -> i32 {
        if child_id == parent_id {
            return 0;
        }
        let (Some(child), Some(parent)) = (child_id, parent_id) else {
            return -1;
        };

        let mut current = child;
        let mut distance = 0;
        // Bounded walk; a malformed tree must not loop forever.
        for _ in 0..self.max_depth() {
            match self.parent_policy_id(current) {
                Some(next) => {
                    distance += 1;
                    if next == parent {
                        return distance;
                    }
                    current = next;
                }
                None => return -1,
            }
        }
        -1
    }

    /// Upper bound on ancestor walks
    fn max_depth(&self) -> usize {
        64
    }
}

/// Generation distance, falling back when no policy manager is installed
///
/// Without a manager the only knowable relations are identity and "no
/// policy", both distance 0; everything else is unrelated.
pub fn generation_diff(
    manager: Option<&dyn PolicyManager>,
    child_id: Option<PolicyId>,
    parent_id: Option<PolicyId>,
) -> i32 {
    if let Some(manager) = manager {
        return manager.policy_generation_diff(child_id, parent_id);
    }
    if child_id.is_none() || child_id == parent_id {
        return 0;
    }
    -1
}

/// Whether a node living in `node_policy` processes sessions on `policy_id`
///
/// Services (`node_policy == None`) match everything; "no policy" sessions
/// match only services; otherwise the node must live in the session's
/// policy or one of its ancestors.
pub fn policy_match(
    manager: Option<&dyn PolicyManager>,
    node_policy: Option<PolicyId>,
    policy_id: Option<PolicyId>,
) -> bool {
    let Some(node_policy) = node_policy else {
        return true;
    };
    let Some(policy_id) = policy_id else {
        return false;
    };
    if node_policy == policy_id {
        return true;
    }
    let Some(manager) = manager else {
        return false;
    };

    let mut parent = manager.parent_policy_id(policy_id);
    for _ in 0..manager.max_depth() {
        match parent {
            Some(id) if id == node_policy => return true,
            Some(id) => parent = manager.parent_policy_id(id),
            None => return false,
        }
    }
    false
}

/// In-memory [`PolicyManager`]
#[derive(Debug, Default)]
pub struct PolicyTree {
    parents: RwLock<HashMap<PolicyId, Option<PolicyId>>>,
}

impl PolicyTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a policy under `parent`
    ///
    /// The parent must already exist and the new link must not close a cycle.
    pub fn insert(&self, id: PolicyId, parent: Option<PolicyId>) -> Result<()> {
        let mut parents = self.parents.write();
        if let Some(parent) = parent {
            if !parents.contains_key(&parent) {
                return Err(Error::UnknownPolicy(parent));
            }
            let mut current = Some(parent);
            while let Some(p) = current {
                if p == id {
                    return Err(Error::PolicyCycle(id));
                }
                current = parents.get(&p).copied().flatten();
            }
        }
        parents.insert(id, parent);
        Ok(())
    }

    /// Remove a policy; children are re-attached to its parent
    pub fn remove(&self, id: PolicyId) -> bool {
        let mut parents = self.parents.write();
        let Some(grandparent) = parents.remove(&id) else {
            return false;
        };
        for parent in parents.values_mut() {
            if *parent == Some(id) {
                *parent = grandparent;
            }
        }
        true
    }

    /// Whether the policy exists
    pub fn contains(&self, id: PolicyId) -> bool {
        self.parents.read().contains_key(&id)
    }

    /// Number of policies
    pub fn len(&self) -> usize {
        self.parents.read().len()
    }

    /// Check if the tree is empty
    pub fn is_empty(&self) -> bool {
        self.parents.read().is_empty()
    }
}

impl PolicyManager for PolicyTree {
    fn parent_policy_id(&self, policy_id: PolicyId) -> Option<PolicyId> {
        self.parents.read().get(&policy_id).copied().flatten()
    }

    fn max_depth(&self) -> usize {
        self.len() + 1
    }
}
