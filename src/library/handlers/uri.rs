//! Sorted URI prefixes with the "same as previous" skip table.
//!
//! Entries of one method group are kept sorted with `/` ordered before
//! every other byte. Next to each entry we remember how many leading bytes
//! it shares with the entry before it, so a lookup never compares a prefix
//! it already compared for an earlier entry.

use crate::library::{
    error::{GatewayError, GatewayResult},
    handlers::{BackendId, HandlerId},
    protocol::http::Method,
};
use std::cmp::Ordering;

#[inline(always)]
fn rank(b: u8) -> u16 {
    if b == b'/' { 0 } else { b as u16 + 1 }
}

/// Lexicographic order with `/` as the smallest byte.
pub fn compare_uris(a: &[u8], b: &[u8]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        match rank(*x).cmp(&rank(*y)) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

#[inline(always)]
fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

#[inline(always)]
fn is_boundary(b: u8) -> bool {
    b == b'/' || b == b'?'
}

struct UriEntry {
    /// Normalized bytes the matcher compares against.
    key: Vec<u8>,
    uri: String,
    same_as_previous: usize,
    lists: Vec<(BackendId, HandlerId)>,
}

struct UriGroup {
    method: Option<Method>,
    entries: Vec<UriEntry>,
}

impl UriGroup {
    fn resort(&mut self) {
        self.entries.sort_by(|a, b| compare_uris(&a.key, &b.key));
        for i in 0..self.entries.len() {
            let same = match i {
                0 => 0,
                _ => common_prefix(&self.entries[i - 1].key, &self.entries[i].key),
            };
            self.entries[i].same_as_previous = same;
        }
    }

    /// Index and length of the longest accepted prefix of `query`.
    fn search(&self, query: &[u8], strict: bool) -> Option<(usize, usize)> {
        let mut same = 0;
        let mut best = None;
        let mut max = 0;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.same_as_previous > same {
                // Diverges from the query exactly where the previous entry did.
                continue;
            }
            let from = entry.same_as_previous;
            same = from + common_prefix(&query[from.min(query.len())..], &entry.key[from..]);
            if same == entry.key.len() {
                if strict
                    && query.len() > same
                    && same > 0
                    && !is_boundary(entry.key[same - 1])
                    && !is_boundary(query[same])
                {
                    continue;
                }
                best = Some(i);
                max = same;
            } else if same < max {
                break;
            }
        }
        best.map(|i| (i, max))
    }
}

/// Result of a successful lookup.
#[derive(Debug, Clone, Copy)]
pub struct UriMatch<'a> {
    pub method: Option<Method>,
    pub uri: &'a str,
    pub matched_len: usize,
    /// Handler lists in attachment order.
    pub lists: &'a [(BackendId, HandlerId)],
}

pub struct RegisteredUris {
    groups: Vec<UriGroup>,
    case_insensitive: bool,
    strict_boundaries: bool,
}

impl RegisteredUris {
    pub fn new(case_insensitive: bool, strict_boundaries: bool) -> RegisteredUris {
        RegisteredUris {
            groups: Vec::new(),
            case_insensitive,
            strict_boundaries,
        }
    }

    fn normalize(&self, uri: &str) -> Vec<u8> {
        if self.case_insensitive {
            uri.as_bytes().to_ascii_lowercase()
        } else {
            uri.as_bytes().to_vec()
        }
    }

    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds a handler list to `method uri`, creating the entry if needed.
    /// A backend may attach only one list per entry.
    pub fn attach(
        &mut self,
        method: Option<Method>,
        uri: &str,
        backend: BackendId,
        id: HandlerId,
    ) -> GatewayResult<()> {
        let key = self.normalize(uri);
        let group = match self.groups.iter().position(|g| g.method == method) {
            Some(at) => &mut self.groups[at],
            None => {
                self.groups.push(UriGroup {
                    method,
                    entries: Vec::new(),
                });
                let last = self.groups.len() - 1;
                &mut self.groups[last]
            }
        };
        if let Some(entry) = group.entries.iter_mut().find(|e| e.key == key) {
            if entry.lists.iter().any(|(b, _)| *b == backend) {
                return Err(GatewayError::UriAlreadyRegistered(uri.to_string(), backend));
            }
            entry.lists.push((backend, id));
            return Ok(());
        }
        group.entries.push(UriEntry {
            key,
            uri: uri.to_string(),
            same_as_previous: 0,
            lists: vec![(backend, id)],
        });
        group.resort();
        Ok(())
    }

    fn retain_lists(&mut self, mut keep: impl FnMut(&(BackendId, HandlerId)) -> bool) -> Vec<HandlerId> {
        let mut removed = Vec::new();
        for group in self.groups.iter_mut() {
            let before = group.entries.len();
            for entry in group.entries.iter_mut() {
                entry.lists.retain(|list| {
                    let kept = keep(list);
                    if !kept {
                        removed.push(list.1);
                    }
                    kept
                });
            }
            group.entries.retain(|e| !e.lists.is_empty());
            if group.entries.len() != before {
                group.resort();
            }
        }
        self.groups.retain(|g| !g.entries.is_empty());
        removed
    }

    /// Drops one handler list from every entry it is attached to.
    pub fn detach(&mut self, id: HandlerId) -> bool {
        !self.retain_lists(|(_, list)| *list != id).is_empty()
    }

    /// Drops every list owned by `backend`; entries left without lists go away.
    pub fn detach_backend(&mut self, backend: BackendId) -> Vec<HandlerId> {
        self.retain_lists(|(owner, _)| *owner != backend)
    }

    /// Longest registered prefix of `uri` for `method`. Entries registered
    /// for any method compete with the method's own, which win ties.
    pub fn resolve(&self, method: Method, uri: &[u8]) -> Option<UriMatch<'_>> {
        let lowered;
        let query = if self.case_insensitive {
            lowered = uri.to_ascii_lowercase();
            &lowered[..]
        } else {
            uri
        };
        let mut found: Option<(&UriGroup, usize, usize)> = None;
        for group in self.groups.iter() {
            if group.method.is_some() && group.method != Some(method) {
                continue;
            }
            if let Some((at, len)) = group.search(query, self.strict_boundaries) {
                let better = match found {
                    None => true,
                    Some((current, _, current_len)) => {
                        len > current_len || (len == current_len && current.method.is_none())
                    }
                };
                if better {
                    found = Some((group, at, len));
                }
            }
        }
        found.map(|(group, at, len)| {
            let entry = &group.entries[at];
            UriMatch {
                method: group.method,
                uri: &entry.uri,
                matched_len: len,
                lists: &entry.lists,
            }
        })
    }

    /// Every entry as `(method, uri, lists)`, sorted within each method.
    pub fn iter(&self) -> impl Iterator<Item = (Option<Method>, &str, &[(BackendId, HandlerId)])> {
        self.groups.iter().flat_map(|group| {
            group
                .entries
                .iter()
                .map(move |e| (group.method, e.uri.as_str(), e.lists.as_slice()))
        })
    }
}
