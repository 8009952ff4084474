//! Arena of logical handles.
//!
//! Every open connection, statement and result set is a node addressed by a
//! generational [`HandleId`]. A node owns the physical handles of its kind,
//! one per backend, and the ids of its children. Closing a node removes its
//! whole subtree, children first.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{self, Backend, Connection as _, ResultSet as _, Statement as _};
use crate::error::{BackendResult, ClusterError, Result};

/// A physical handle shared between the arena and in-flight tasks.
pub type Shared<P> = Arc<Mutex<P>>;

/// Physical handles of one logical handle, ordered by backend.
pub type PhysicalMap<P> = BTreeMap<Arc<Backend>, Shared<P>>;

pub type PhysicalConnection = Box<dyn backend::Connection>;
pub type PhysicalStatement = Box<dyn backend::Statement>;
pub type PhysicalResultSet = Box<dyn backend::ResultSet>;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.index, self.generation)
    }
}

pub enum Physical {
    Connection(PhysicalMap<PhysicalConnection>),
    Statement(PhysicalMap<PhysicalStatement>),
    ResultSet(PhysicalMap<PhysicalResultSet>),
}

impl Physical {
    /// Closes every physical handle. Errors are logged and dropped: the
    /// logical handle is gone either way.
    pub fn close(self) {
        match self {
            Physical::Connection(map) => close_all(map),
            Physical::Statement(map) => close_all(map),
            Physical::ResultSet(map) => close_all(map),
        }
    }
}

/// Typed access to one variant of [`Physical`].
pub trait PhysicalKind: Send + Sized + 'static {
    const NAME: &'static str;

    fn wrap(map: PhysicalMap<Self>) -> Physical;
    fn map(physical: &Physical) -> Option<&PhysicalMap<Self>>;
    fn map_mut(physical: &mut Physical) -> Option<&mut PhysicalMap<Self>>;
    fn close_physical(&mut self) -> BackendResult<()>;
}

impl PhysicalKind for PhysicalConnection {
    const NAME: &'static str = "connection";

    fn wrap(map: PhysicalMap<Self>) -> Physical {
        Physical::Connection(map)
    }

    fn map(physical: &Physical) -> Option<&PhysicalMap<Self>> {
        match physical {
            Physical::Connection(map) => Some(map),
            _ => None,
        }
    }

    fn map_mut(physical: &mut Physical) -> Option<&mut PhysicalMap<Self>> {
        match physical {
            Physical::Connection(map) => Some(map),
            _ => None,
        }
    }

    fn close_physical(&mut self) -> BackendResult<()> {
        self.close()
    }
}

impl PhysicalKind for PhysicalStatement {
    const NAME: &'static str = "statement";

    fn wrap(map: PhysicalMap<Self>) -> Physical {
        Physical::Statement(map)
    }

    fn map(physical: &Physical) -> Option<&PhysicalMap<Self>> {
        match physical {
            Physical::Statement(map) => Some(map),
            _ => None,
        }
    }

    fn map_mut(physical: &mut Physical) -> Option<&mut PhysicalMap<Self>> {
        match physical {
            Physical::Statement(map) => Some(map),
            _ => None,
        }
    }

    fn close_physical(&mut self) -> BackendResult<()> {
        self.close()
    }
}

impl PhysicalKind for PhysicalResultSet {
    const NAME: &'static str = "result set";

    fn wrap(map: PhysicalMap<Self>) -> Physical {
        Physical::ResultSet(map)
    }

    fn map(physical: &Physical) -> Option<&PhysicalMap<Self>> {
        match physical {
            Physical::ResultSet(map) => Some(map),
            _ => None,
        }
    }

    fn map_mut(physical: &mut Physical) -> Option<&mut PhysicalMap<Self>> {
        match physical {
            Physical::ResultSet(map) => Some(map),
            _ => None,
        }
    }

    fn close_physical(&mut self) -> BackendResult<()> {
        self.close()
    }
}

pub(crate) fn close_all<P: PhysicalKind>(map: PhysicalMap<P>) {
    for (backend, shared) in map {
        if let Err(e) = shared.lock().close_physical() {
            tracing::warn!(backend = %backend, kind = P::NAME, error = %e, "close failed");
        }
    }
}

/// Wraps created physical handles for insertion into the arena.
pub(crate) fn share<P: PhysicalKind>(created: BTreeMap<Arc<Backend>, P>) -> PhysicalMap<P> {
    created
        .into_iter()
        .map(|(backend, p)| (backend, Arc::new(Mutex::new(p))))
        .collect()
}

struct Node {
    parent: Option<HandleId>,
    children: Vec<HandleId>,
    physical: Physical,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Default)]
pub struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, id: HandleId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: HandleId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }

    /// Registers a handle under `parent`. Fails if the parent was closed.
    pub fn insert(&mut self, parent: Option<HandleId>, physical: Physical) -> Result<HandleId> {
        if let Some(parent) = parent {
            if self.node(parent).is_none() {
                return Err(ClusterError::HandleClosed);
            }
        }
        let node = Node {
            parent,
            children: Vec::new(),
            physical,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                HandleId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                HandleId {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        if let Some(parent) = parent.and_then(|p| self.node_mut(p)) {
            parent.children.push(id);
        }
        Ok(id)
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.node(id).is_some()
    }

    pub fn parent(&self, id: HandleId) -> Option<HandleId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: HandleId) -> Vec<HandleId> {
        self.node(id).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the physical handles of `id`.
    pub fn physical<P: PhysicalKind>(&self, id: HandleId) -> Result<PhysicalMap<P>> {
        self.node(id)
            .and_then(|n| P::map(&n.physical))
            .cloned()
            .ok_or(ClusterError::HandleClosed)
    }

    /// Drops the physical handles of `id` whose backend fails `keep`, and
    /// returns them for closing outside the table lock.
    pub fn prune<P: PhysicalKind>(
        &mut self,
        id: HandleId,
        keep: impl Fn(&Backend) -> bool,
    ) -> Result<PhysicalMap<P>> {
        let map = self
            .node_mut(id)
            .and_then(|n| P::map_mut(&mut n.physical))
            .ok_or(ClusterError::HandleClosed)?;
        let stale: Vec<Arc<Backend>> = map.keys().filter(|b| !keep(b)).cloned().collect();
        Ok(stale
            .into_iter()
            .filter_map(|b| map.remove_entry(&b))
            .collect())
    }

    /// Removes `id` and its descendants. Returns their physical handles in
    /// close order: deepest children first, `id` last.
    pub fn remove(&mut self, id: HandleId) -> Vec<Physical> {
        let Some(node) = self.take(id) else {
            return Vec::new();
        };
        if let Some(parent) = node.parent.and_then(|p| self.node_mut(p)) {
            parent.children.retain(|c| *c != id);
        }
        let mut closing = Vec::new();
        self.collect_subtree(node, &mut closing);
        closing
    }

    fn take(&mut self, id: HandleId) -> Option<Node> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(node)
    }

    fn collect_subtree(&mut self, node: Node, closing: &mut Vec<Physical>) {
        for child in &node.children {
            if let Some(child_node) = self.take(*child) {
                self.collect_subtree(child_node, closing);
            }
        }
        closing.push(node.physical);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_statement() -> Physical {
        Physical::Statement(BTreeMap::new())
    }

    fn empty_connection() -> Physical {
        Physical::Connection(BTreeMap::new())
    }

    fn kind(p: &Physical) -> &'static str {
        match p {
            Physical::Connection(_) => "connection",
            Physical::Statement(_) => "statement",
            Physical::ResultSet(_) => "result set",
        }
    }

    #[test]
    fn test_cascade_closes_children_first() {
        let mut table = HandleTable::new();
        let conn = table.insert(None, empty_connection()).unwrap();
        let stmt = table.insert(Some(conn), empty_statement()).unwrap();
        let rs = table
            .insert(Some(stmt), Physical::ResultSet(BTreeMap::new()))
            .unwrap();
        assert_eq!(table.children(conn), vec![stmt]);
        assert_eq!(table.parent(rs), Some(stmt));

        let closing = table.remove(conn);
        let kinds: Vec<&str> = closing.iter().map(kind).collect();
        assert_eq!(kinds, vec!["result set", "statement", "connection"]);
        assert!(!table.contains(conn));
        assert!(!table.contains(stmt));
        assert!(!table.contains(rs));
        assert!(table.is_empty());
    }

    #[test]
    fn test_close_child_detaches_from_parent() {
        let mut table = HandleTable::new();
        let conn = table.insert(None, empty_connection()).unwrap();
        let a = table.insert(Some(conn), empty_statement()).unwrap();
        let b = table.insert(Some(conn), empty_statement()).unwrap();

        assert_eq!(table.remove(a).len(), 1);
        assert_eq!(table.children(conn), vec![b]);
        assert!(table.remove(a).is_empty());
    }

    #[test]
    fn test_stale_id_after_slot_reuse() {
        let mut table = HandleTable::new();
        let first = table.insert(None, empty_connection()).unwrap();
        table.remove(first);
        let second = table.insert(None, empty_connection()).unwrap();

        assert_ne!(first, second);
        assert!(!table.contains(first));
        assert!(table.contains(second));
        assert!(matches!(
            table.physical::<PhysicalConnection>(first),
            Err(ClusterError::HandleClosed)
        ));
    }

    #[test]
    fn test_insert_under_closed_parent_fails() {
        let mut table = HandleTable::new();
        let conn = table.insert(None, empty_connection()).unwrap();
        table.remove(conn);
        assert!(matches!(
            table.insert(Some(conn), empty_statement()),
            Err(ClusterError::HandleClosed)
        ));
    }

    #[test]
    fn test_wrong_kind_is_closed() {
        let mut table = HandleTable::new();
        let conn = table.insert(None, empty_connection()).unwrap();
        assert!(table.physical::<PhysicalStatement>(conn).is_err());
        assert!(table.physical::<PhysicalConnection>(conn).is_ok());
    }
}
