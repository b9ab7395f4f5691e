//! Per-client reference sets: the only strong ownership of canonical
//! objects.  Dropping a reference here is what eventually destroys (and
//! sweeps) an object nobody else holds.

use crate::object_base::{ObjectBase, ObjectRef};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct ClientEntry {
    families: BTreeMap<&'static str, Vec<ObjectRef>>,
}

/// `client key -> family tag -> reference set`.
#[derive(Default)]
pub(crate) struct ClientDb {
    clients: BTreeMap<String, ClientEntry>,
}

impl ClientDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or refresh) a reference.  Re-inserting an object the client
    /// already holds clears its stale flag; that is how commits within an
    /// epoch survive the sweep.
    pub fn insert(&mut self, client: &str, family: &'static str, obj: Arc<dyn ObjectBase>) {
        let refs = self
            .clients
            .entry(client.to_owned())
            .or_default()
            .families
            .entry(family)
            .or_default();
        let fresh = ObjectRef::new(obj);
        if let Some(held) = refs.iter_mut().find(|r| r.ptr_id() == fresh.ptr_id()) {
            held.clear();
        } else {
            refs.push(fresh);
        }
    }

    /// Drop every reference the client holds.  Returns the number dropped.
    pub fn remove_client(&mut self, client: &str) -> usize {
        match self.clients.remove(client) {
            Some(entry) => entry.families.values().map(Vec::len).sum(),
            None => 0,
        }
    }

    /// Set every reference in the client's set to stale.
    pub fn mark(&mut self, client: &str) {
        let Some(entry) = self.clients.get_mut(client) else {
            return;
        };
        for refs in entry.families.values_mut() {
            for r in refs.iter_mut() {
                r.mark();
            }
        }
    }

    /// Drop every still-stale reference.  Returns the number dropped.
    pub fn sweep(&mut self, client: &str) -> usize {
        let Some(entry) = self.clients.get_mut(client) else {
            return 0;
        };
        let mut dropped = 0;
        for refs in entry.families.values_mut() {
            refs.retain(|r| {
                if r.stale() {
                    debug!(client, obj = %r.obj(), "sweeping stale reference");
                    dropped += 1;
                    false
                } else {
                    true
                }
            });
        }
        dropped
    }

    /// Total references held by a client.
    pub fn ref_count(&self, client: &str) -> usize {
        self.clients
            .get(client)
            .map(|e| e.families.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn dump(&self, out: &mut String) {
        for (client, entry) in &self.clients {
            let _ = writeln!(out, "client: {client}");
            for (family, refs) in &entry.families {
                for r in refs {
                    let _ = writeln!(
                        out,
                        "  [{family}{}] {}",
                        if r.stale() { " stale" } else { "" },
                        r.obj()
                    );
                }
            }
        }
    }
}
