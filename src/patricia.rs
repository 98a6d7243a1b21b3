//! Patricia trie over byte strings, stored as an arena of nodes.

/// Index of a node in the trie arena.
type NodeId = u32;

const ROOT: NodeId = 0;

#[derive(Debug, Clone)]
struct Node<V> {
    // edge label from the parent, never empty except for the root
    path: Vec<u8>,
    val: Option<V>,
    // sorted by first byte of the child's path
    children: Vec<(u8, NodeId)>,
}

impl<V> Node<V> {
    fn new(path: Vec<u8>, val: Option<V>) -> Self {
        Node {
            path,
            val,
            children: Vec::new(),
        }
    }

    fn child(&self, b: u8) -> Option<NodeId> {
        self.children
            .binary_search_by_key(&b, |&(c, _)| c)
            .ok()
            .map(|i| self.children[i].1)
    }

    fn add_child(&mut self, b: u8, id: NodeId) {
        match self.children.binary_search_by_key(&b, |&(c, _)| c) {
            Ok(i) => self.children[i].1 = id,
            Err(i) => self.children.insert(i, (b, id)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PatriciaTree<V> {
    nodes: Vec<Node<V>>,
    len: usize,
}

impl<V: Copy> Default for PatriciaTree<V> {
    fn default() -> Self {
        Self::new()
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

impl<V: Copy> PatriciaTree<V> {
    pub fn new() -> Self {
        PatriciaTree {
            nodes: vec![Node::new(Vec::new(), None)],
            len: 0,
        }
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn push(&mut self, node: Node<V>) -> NodeId {
        self.nodes.push(node);
        (self.nodes.len() - 1) as NodeId
    }

    fn set_val(&mut self, n: NodeId, value: V) {
        if self.nodes[n as usize].val.replace(value).is_none() {
            self.len += 1;
        }
    }

    pub fn insert(&mut self, key: &[u8], value: V) {
        let mut n = ROOT;
        let mut i = 0;
        loop {
            if i == key.len() {
                self.set_val(n, value);
                return;
            }
            let Some(c) = self.nodes[n as usize].child(key[i]) else {
                let leaf = self.push(Node::new(key[i..].to_vec(), Some(value)));
                self.nodes[n as usize].add_child(key[i], leaf);
                self.len += 1;
                return;
            };

            let common = common_prefix_len(&key[i..], &self.nodes[c as usize].path);
            if common < self.nodes[c as usize].path.len() {
                // split c: it keeps the common prefix, the rest moves to a new child
                let node = &mut self.nodes[c as usize];
                let tail = node.path.split_off(common);
                let tail_first = tail[0];
                let moved = Node {
                    path: tail,
                    val: node.val.take(),
                    children: std::mem::take(&mut node.children),
                };
                let moved_id = self.push(moved);
                self.nodes[c as usize].add_child(tail_first, moved_id);
            }
            i += common;
            n = c;
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<V> {
        let mut n = ROOT;
        let mut i = 0;
        while i < key.len() {
            let c = self.nodes[n as usize].child(key[i])?;
            let path = &self.nodes[c as usize].path;
            if !key[i..].starts_with(path) {
                return None;
            }
            i += path.len();
            n = c;
        }
        self.nodes[n as usize].val
    }

    /// Value of the longest key that is a prefix of `data`, with its length.
    pub fn longest_prefix(&self, data: &[u8]) -> Option<(usize, V)> {
        let mut best = self.nodes[ROOT as usize].val.map(|v| (0, v));
        let mut n = ROOT;
        let mut i = 0;
        while i < data.len() {
            let Some(c) = self.nodes[n as usize].child(data[i]) else {
                break;
            };
            let path = &self.nodes[c as usize].path;
            if !data[i..].starts_with(path) {
                break;
            }
            i += path.len();
            n = c;
            if let Some(v) = self.nodes[n as usize].val {
                best = Some((i, v));
            }
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match<V> {
    pub start: usize,
    pub end: usize,
    pub val: V,
}

/// Finds dictionary occurrences inside words. Keeps its result buffer
/// between calls, so one finder per worker.
pub struct MatchFinder<'a, V> {
    pt: &'a PatriciaTree<V>,
    matches: Vec<Match<V>>,
}

impl<'a, V: Copy> MatchFinder<'a, V> {
    pub fn new(pt: &'a PatriciaTree<V>) -> Self {
        MatchFinder {
            pt,
            matches: Vec::new(),
        }
    }

    /// For every start offset takes the longest key found there, dropping
    /// matches that end inside an earlier one. Result is ordered by start;
    /// overlapping matches are kept.
    pub fn find_longest_matches(&mut self, data: &[u8]) -> &[Match<V>] {
        self.matches.clear();
        let mut last_end = 0;
        for start in 0..data.len() {
            if let Some((l, val)) = self.pt.longest_prefix(&data[start..]) {
                let end = start + l;
                if l > 0 && end > last_end {
                    self.matches.push(Match { start, end, val });
                    last_end = end;
                }
            }
        }
        &self.matches
    }
}
