//! The client tag cache.
//!
//! A fixed-capacity circular doubly linked list held in an index arena.
//! The head stays pinned at the top; a tag found in the cache bubbles up
//! one position, so the most-searched-for tags collect near the head and
//! the tail holds the lesser used ones. At capacity the tail node is
//! overwritten in place.

use crate::types::TagType;

/// What the cache remembers about a tag.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedTag {
    pub name: String,
    pub index: u32,
    pub tag_type: TagType,
    pub count: u32,
}

struct Node {
    tag: CachedTag,
    next: usize,
    prev: usize,
}

pub struct TagCache {
    nodes: Vec<Node>,
    head: Option<usize>,
    limit: usize,
}

impl TagCache {
    pub fn new(limit: usize) -> TagCache {
        TagCache {
            nodes: Vec::new(),
            head: None,
            limit,
        }
    }

    pub fn find_by_name(&mut self, name: &str) -> Option<CachedTag> {
        let found = self.scan(|tag| tag.name == name)?;
        let tag = self.nodes[found].tag.clone();
        self.hit(found);
        Some(tag)
    }

    pub fn find_by_index(&mut self, index: u32) -> Option<CachedTag> {
        let found = self.scan(|tag| tag.index == index)?;
        let tag = self.nodes[found].tag.clone();
        self.hit(found);
        Some(tag)
    }

    /// Remember a tag. At capacity the tail is reused in place.
    pub fn add(&mut self, tag: CachedTag) {
        if self.limit == 0 {
            return;
        }
        if let Some(dead) = self.scan(|tag| tag.name.is_empty()) {
            self.nodes[dead].tag = tag;
            return;
        }
        match self.head {
            None => {
                self.nodes.push(Node {
                    tag,
                    next: 0,
                    prev: 0,
                });
                self.head = Some(0);
            }
            Some(head) if self.nodes.len() < self.limit => {
                let new = self.nodes.len();
                let tail = self.nodes[head].prev;
                self.nodes.push(Node {
                    tag,
                    next: head,
                    prev: tail,
                });
                self.nodes[tail].next = new;
                self.nodes[head].prev = new;
            }
            Some(head) => {
                let tail = self.nodes[head].prev;
                self.nodes[tail].tag = tag;
            }
        }
    }

    /// Forget a tag, for callers that learn a cached entry went stale.
    /// The slot stays in the ring and is the first one a later add refills.
    pub fn invalidate(&mut self, index: u32) {
        if let Some(found) = self.scan(|tag| tag.index == index) {
            self.nodes[found].tag.name = String::new();
            self.nodes[found].tag.index = u32::MAX;
        }
    }

    fn scan<F: Fn(&CachedTag) -> bool>(&self, matches: F) -> Option<usize> {
        let head = self.head?;
        let mut at = head;
        loop {
            if matches(&self.nodes[at].tag) {
                return Some(at);
            }
            at = self.nodes[at].next;
            if at == head {
                return None;
            }
        }
    }

    // Bubble the node one position toward the head. The special case is
    // when the node lands first: then the head pointer moves instead.
    fn hit(&mut self, this: usize) {
        let head = match self.head {
            Some(head) if head != this => head,
            _ => return,
        };
        if self.nodes.len() == 2 {
            self.head = Some(this);
            return;
        }
        if self.nodes[head].next == this {
            self.head = Some(this);
        }
        let after = self.nodes[this].prev;
        let before = self.nodes[after].prev;
        let following = self.nodes[this].next;
        self.nodes[before].next = this;
        self.nodes[after].prev = this;
        self.nodes[after].next = following;
        self.nodes[following].prev = after;
        self.nodes[this].next = after;
        self.nodes[this].prev = before;
    }

    #[cfg(test)]
    fn order(&self) -> Vec<String> {
        let mut out = Vec::new();
        let head = match self.head {
            Some(head) => head,
            None => return out,
        };
        let mut at = head;
        loop {
            out.push(self.nodes[at].tag.name.clone());
            at = self.nodes[at].next;
            if at == head {
                break;
            }
        }
        out
    }
}
