//! Bidirectional peer-id ↔ holon-name registry.
//!
//! A peer holds at most one name; a name holds every peer registered under
//! it, in insertion order.  The resolver returns the first entry that is not
//! the caller, so a peer can never dispatch to itself by name.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct Registry {
    by_peer: HashMap<String, String>,
    by_name: HashMap<String, Vec<String>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate `peer_id` with `name` (trimmed).  A peer that already held
    /// a different name is moved: removed from the old name's set first.
    /// Returns the stored name, or `None` when the trimmed name is empty.
    pub fn register(&mut self, peer_id: &str, name: &str) -> Option<String> {
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        if let Some(previous) = self.by_peer.get(peer_id) {
            if previous == name {
                return Some(name.to_owned());
            }
            let previous = previous.clone();
            self.remove_from_name(&previous, peer_id);
        }
        self.by_peer.insert(peer_id.to_owned(), name.to_owned());
        let entries = self.by_name.entry(name.to_owned()).or_default();
        if !entries.iter().any(|p| p == peer_id) {
            entries.push(peer_id.to_owned());
        }
        Some(name.to_owned())
    }

    /// Remove both directions.  A no-op for unknown peers.
    pub fn deregister(&mut self, peer_id: &str) {
        if let Some(name) = self.by_peer.remove(peer_id) {
            self.remove_from_name(&name, peer_id);
        }
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn name_of(&self, peer_id: &str) -> Option<&str> {
        self.by_peer.get(peer_id).map(String::as_str)
    }

    /// First peer registered under `name` other than `exclude`.
    pub fn resolve(&self, name: &str, exclude: &str) -> Option<String> {
        self.by_name
            .get(name)?
            .iter()
            .find(|peer| peer.as_str() != exclude)
            .cloned()
    }

    fn remove_from_name(&mut self, name: &str, peer_id: &str) {
        if let Some(entries) = self.by_name.get_mut(name) {
            entries.retain(|p| p != peer_id);
            if entries.is_empty() {
                self.by_name.remove(name);
            }
        }
    }
}

/// Split a dotted method name into a `(holon name, method)` dispatch route.
///
/// The split is on the first `.`; both sides must be non-empty after
/// trimming.  `a.b.c` routes to holon `a` with method `b.c`.
pub fn parse_dispatch_route(method: &str) -> Option<(String, String)> {
    let (name, rest) = method.split_once('.')?;
    let name = name.trim();
    let rest = rest.trim();
    if name.is_empty() || rest.is_empty() {
        return None;
    }
    Some((name.to_owned(), rest.to_owned()))
}
