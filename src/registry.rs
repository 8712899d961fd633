//! Endpoint lookup service.
//!
//! Nodes only consult the registry on the control thread: to claim names, to
//! record which master they hang off and to walk chains of virtual endpoints
//! when deciding whether a move would create a loop.

use hashbrown::HashMap;
use parking_lot::RwLock;
use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::{Directed, Direction};
use tracing::debug;

use crate::endpoint::EndpointId;
use crate::error::VsourceError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Source,
    Sink,
    /// The capture side of a sink
    Monitor,
}

/// Name and id allocation plus upstream chain tracking.
pub trait EndpointLookup: Send + Sync {
    /// Claim `name`. Fails if the name is taken.
    fn register(&self, name: &str, kind: EndpointKind) -> Result<EndpointId, VsourceError>;
    fn unregister(&self, id: EndpointId);
    fn find(&self, name: &str) -> Option<EndpointId>;
    fn name_of(&self, id: EndpointId) -> Option<String>;

    /// Record that `id` takes its audio from `upstream`.
    fn set_upstream(&self, id: EndpointId, upstream: Option<EndpointId>);
    fn upstream_of(&self, id: EndpointId) -> Option<EndpointId>;

    /// Follow upstream links from `id` until an endpoint without one.
    fn chain_root(&self, id: EndpointId) -> EndpointId {
        let mut current = id;
        // bounded, cycles end the walk
        for _ in 0..4096 {
            match self.upstream_of(current) {
                Some(next) if next != id => current = next,
                _ => break,
            }
        }
        current
    }
}

#[derive(Clone, Debug)]
struct Entry {
    id: EndpointId,
    name: String,
    kind: EndpointKind,
}

#[derive(Default)]
struct Inner {
    /// Edges point from an endpoint to its upstream master
    graph: StableGraph<Entry, (), Directed>,
    by_name: HashMap<String, NodeIndex>,
    by_id: HashMap<EndpointId, NodeIndex>,
    next_id: u32,
}

/// In-memory [`EndpointLookup`].
#[derive(Default)]
pub struct EndpointRegistry {
    inner: RwLock<Inner>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind_of(&self, id: EndpointId) -> Option<EndpointKind> {
        let inner = self.inner.read();
        inner.by_id.get(&id).map(|idx| inner.graph[*idx].kind)
    }

    /// Endpoints that take their audio from `id`.
    pub fn downstream_of(&self, id: EndpointId) -> Vec<EndpointId> {
        let inner = self.inner.read();
        let Some(idx) = inner.by_id.get(&id) else {
            return Vec::new();
        };
        inner
            .graph
            .neighbors_directed(*idx, Direction::Incoming)
            .map(|n| inner.graph[n].id)
            .collect()
    }
}

impl EndpointLookup for EndpointRegistry {
    fn register(&self, name: &str, kind: EndpointKind) -> Result<EndpointId, VsourceError> {
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(name) {
            return Err(VsourceError::resource_exhausted(format!("endpoint name '{name}' already in use")));
        }

        let id = EndpointId(inner.next_id);
        inner.next_id += 1;

        let idx = inner.graph.add_node(Entry { id, name: name.to_owned(), kind });
        inner.by_name.insert(name.to_owned(), idx);
        inner.by_id.insert(id, idx);

        debug!(%id, name, ?kind, "registered endpoint");
        Ok(id)
    }

    fn unregister(&self, id: EndpointId) {
        let mut inner = self.inner.write();
        if let Some(idx) = inner.by_id.remove(&id) {
            if let Some(entry) = inner.graph.remove_node(idx) {
                inner.by_name.remove(&entry.name);
                debug!(%id, name = %entry.name, "unregistered endpoint");
            }
        }
    }

    fn find(&self, name: &str) -> Option<EndpointId> {
        let inner = self.inner.read();
        inner.by_name.get(name).map(|idx| inner.graph[*idx].id)
    }

    fn name_of(&self, id: EndpointId) -> Option<String> {
        let inner = self.inner.read();
        inner.by_id.get(&id).map(|idx| inner.graph[*idx].name.clone())
    }

    fn set_upstream(&self, id: EndpointId, upstream: Option<EndpointId>) {
        let mut inner = self.inner.write();
        let Some(&idx) = inner.by_id.get(&id) else {
            return;
        };

        let old: Vec<_> = inner.graph.neighbors_directed(idx, Direction::Outgoing).collect();
        for up in old {
            if let Some(edge) = inner.graph.find_edge(idx, up) {
                inner.graph.remove_edge(edge);
            }
        }

        let up = upstream.and_then(|u| inner.by_id.get(&u).copied());
        if let Some(up) = up {
            inner.graph.add_edge(idx, up, ());
        }
    }

    fn upstream_of(&self, id: EndpointId) -> Option<EndpointId> {
        let inner = self.inner.read();
        let idx = inner.by_id.get(&id)?;
        inner
            .graph
            .neighbors_directed(*idx, Direction::Outgoing)
            .next()
            .map(|n| inner.graph[n].id)
    }
}
