//! Introspection sink: family handlers register string tags and a show
//! callback; a debug CLI resolves a tag and renders the family's state.

use crate::om::{Listener, Om};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::sync::Arc;

struct Entry {
    tags: &'static [&'static str],
    description: &'static str,
    handler: Arc<dyn Listener>,
}

/// Tag -> handler registry.
#[derive(Default)]
pub struct Inspect {
    entries: Mutex<Vec<Entry>>,
}

impl Inspect {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, handler: Arc<dyn Listener>) {
        self.entries.lock().push(Entry {
            tags: handler.tags(),
            description: handler.description(),
            handler,
        });
    }

    /// Render the family registered under `tag`, or None for an unknown tag.
    pub fn show(&self, om: &Om, tag: &str) -> Option<String> {
        let handler = self
            .entries
            .lock()
            .iter()
            .find(|e| e.tags.contains(&tag))
            .map(|e| e.handler.clone())?;
        let mut out = String::new();
        handler.show(om, &mut out);
        Some(out)
    }

    /// Render every registered family with its description header.
    pub fn show_all(&self, om: &Om) -> String {
        let handlers: Vec<(&'static str, Arc<dyn Listener>)> = self
            .entries
            .lock()
            .iter()
            .map(|e| (e.description, e.handler.clone()))
            .collect();
        let mut out = String::new();
        for (description, handler) in handlers {
            let _ = writeln!(out, "== {description}");
            handler.show(om, &mut out);
        }
        out
    }

    /// The known tags, for a CLI's help output.
    pub fn tags(&self) -> Vec<&'static str> {
        self.entries
            .lock()
            .iter()
            .flat_map(|e| e.tags.iter().copied())
            .collect()
    }
}
