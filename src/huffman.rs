//! Huffman code assignment and serialization of the offset-addressed trees.
//!
//! A serialized tree is a run of leaf records followed by internal nodes, each
//! node being two varint child offsets. Leaves occupy offsets below the
//! cutoff, so a reader tells a leaf from a node by comparing against it.

use crate::compress::{encode_varint, uvarint_len};
use crate::error::CompressionError;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::{self, Write};

/// One symbol to be coded: how often it is used and how many bytes its
/// serialized leaf record takes.
#[derive(Debug, Clone, Copy)]
pub struct HuffLeaf {
    pub uses: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Child {
    Leaf(usize),
    Node(usize),
}

#[derive(Debug)]
struct HuffNode {
    children: [Child; 2],
    offset: u64,
}

/// Result of coding one symbol set. Codes are indexed like the input leaves.
/// Bit `k` of a code is the branch taken at depth `k`, so the root branch is
/// the least significant bit and is written first.
#[derive(Debug, Default)]
pub struct HuffmanCodes {
    pub codes: Vec<(u64, usize)>,
    leaf_offsets: Vec<u64>,
    nodes: Vec<HuffNode>,
    pub root_offset: u64,
    pub cutoff: u64,
    /// Serialized bytes of leaves plus nodes.
    pub size: u64,
}

impl HuffmanCodes {
    fn offset(&self, c: Child) -> u64 {
        match c {
            Child::Leaf(i) => self.leaf_offsets[i],
            Child::Node(i) => self.nodes[i].offset,
        }
    }

    pub fn depth(&self) -> usize {
        self.codes.iter().map(|&(_, bits)| bits).max().unwrap_or(0)
    }
}

/// Builds codes for `leaves`, which must already be sorted by ascending
/// `uses`. At every merge the two lightest of {next leaf, lightest node} are
/// taken, preferring the leaf on equal weight; nodes of equal weight come out
/// in creation order.
pub fn build_huffman(leaves: &[HuffLeaf]) -> Result<HuffmanCodes, CompressionError> {
    let mut res = HuffmanCodes {
        codes: vec![(0, 0); leaves.len()],
        ..Default::default()
    };
    let mut offset = 0u64;
    for leaf in leaves {
        res.leaf_offsets.push(offset);
        offset += leaf.size;
    }
    res.cutoff = offset;

    // (uses, tie breaker) of pending nodes; the tie breaker is the node index
    let mut heap: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::new();
    let mut i = 0;
    while heap.len() + (leaves.len() - i) > 1 {
        let mut children = [Child::Leaf(0); 2];
        let mut uses = 0u64;
        for child in children.iter_mut() {
            let take_node = heap
                .peek()
                .is_some_and(|&Reverse((w, _))| i >= leaves.len() || w < leaves[i].uses);
            match if take_node { heap.pop() } else { None } {
                Some(Reverse((w, idx))) => {
                    *child = Child::Node(idx);
                    uses += w;
                }
                None => {
                    *child = Child::Leaf(i);
                    uses += leaves[i].uses;
                    i += 1;
                }
            }
        }
        let idx = res.nodes.len();
        let node_size =
            uvarint_len(res.offset(children[0])) + uvarint_len(res.offset(children[1]));
        res.nodes.push(HuffNode { children, offset });
        offset += node_size as u64;
        heap.push(Reverse((uses, idx)));
    }
    res.size = offset;

    let root = match (res.nodes.len(), leaves.len()) {
        (0, 0) => return Ok(res),
        (0, _) => Child::Leaf(0),
        (n, _) => Child::Node(n - 1),
    };
    res.root_offset = res.offset(root);

    let mut stack = vec![(root, 0u64, 0usize)];
    while let Some((c, code, depth)) = stack.pop() {
        match c {
            Child::Leaf(l) => res.codes[l] = (code, depth),
            Child::Node(n) => {
                if depth >= 64 {
                    return Err(CompressionError::Invariant(format!(
                        "huffman code longer than 64 bits ({} symbols)",
                        leaves.len()
                    )));
                }
                let [c0, c1] = res.nodes[n].children;
                stack.push((c1, code | (1 << depth), depth + 1));
                stack.push((c0, code, depth + 1));
            }
        }
    }
    Ok(res)
}

/// Writes `size`, `root offset`, `cutoff` (big endian), the leaf records
/// produced by `write_leaf` and then the internal nodes.
pub fn write_tree<W, F>(w: &mut W, codes: &HuffmanCodes, mut write_leaf: F) -> io::Result<()>
where
    W: Write,
    F: FnMut(&mut W, usize) -> io::Result<()>,
{
    w.write_all(&codes.size.to_be_bytes())?;
    w.write_all(&codes.root_offset.to_be_bytes())?;
    w.write_all(&codes.cutoff.to_be_bytes())?;
    for i in 0..codes.leaf_offsets.len() {
        write_leaf(w, i)?;
    }
    let mut num_buf = [0u8; 10];
    for node in &codes.nodes {
        for c in node.children {
            let n = encode_varint(&mut num_buf, codes.offset(c));
            w.write_all(&num_buf[..n])?;
        }
    }
    Ok(())
}

/// Orders pattern leaves: ascending uses, ties by the bit-reversed
/// dictionary index.
pub fn pattern_list_cmp(a: (u64, u64), b: (u64, u64)) -> Ordering {
    a.0.cmp(&b.0)
        .then_with(|| a.1.reverse_bits().cmp(&b.1.reverse_bits()))
}

/// LSB-first bit sink over a byte writer.
pub struct BitWriter<W: Write> {
    w: W,
    output_bits: usize,
    output_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(w: W) -> Self {
        BitWriter {
            w,
            output_bits: 0,
            output_byte: 0,
        }
    }

    pub fn encode(&mut self, mut code: u64, mut code_bits: usize) -> io::Result<()> {
        while code_bits > 0 {
            let bits_used = code_bits.min(8 - self.output_bits);
            let mask = (1u64 << bits_used) - 1;
            self.output_byte |= ((code & mask) << self.output_bits) as u8;
            code >>= bits_used;
            code_bits -= bits_used;
            self.output_bits += bits_used;

            if self.output_bits == 8 {
                self.w.write_all(&[self.output_byte])?;
                self.output_bits = 0;
                self.output_byte = 0;
            }
        }
        Ok(())
    }

    /// Pads the pending byte with zero bits and emits it.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.output_bits > 0 {
            self.w.write_all(&[self.output_byte])?;
            self.output_bits = 0;
            self.output_byte = 0;
        }
        Ok(())
    }

    /// Byte-aligned access to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.w
    }

    pub fn into_inner(self) -> W {
        self.w
    }
}
