//! A container for identifiers that may be invalidated elsewhere.
//!
//! Sessions are remembered here for error notification (a socket keeps the
//! ids of in-flight RPCs, for example). Insertions come from one thread;
//! invalidation happens implicitly when the id's version moves on. Instead
//! of removing dead ids eagerly, the list overwrites them lazily when new
//! ids are inserted: `add` probes a few positions for a dead entry and, if
//! the neighborhood is crowded with live ids, splits the current block and
//! scatters the conflicting entries so that later probes find gaps.
//!
//! Not thread-safe; a single writer owns the list.

use crate::error::{Error, ErrorKind, Result};

/// Identifiers per block. Chosen so a block plus its bookkeeping stays
/// within a cache-friendly allocation.
const BLOCK_SIZE: usize = 63;

/// Probes per insertion before the neighborhood counts as crowded.
const PROBES: usize = 4;

type Block<T> = Box<[Option<T>; BLOCK_SIZE]>;

fn empty_block<T: Copy>() -> Block<T> {
    Box::new([None; BLOCK_SIZE])
}

/// Lazily-compacted list of possibly-stale identifiers.
pub struct ListOfAbaFreeId<T: Copy + PartialEq> {
    blocks: Vec<Block<T>>,
    cur_block: usize,
    cur_index: usize,
    max_entries: usize,
}

impl<T: Copy + PartialEq> ListOfAbaFreeId<T> {
    /// Creates a list bounded to roughly `max_entries` identifiers.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            blocks: vec![empty_block()],
            cur_block: 0,
            cur_index: 0,
            max_entries: max_entries.max(BLOCK_SIZE),
        }
    }

    fn forward(&mut self) {
        self.cur_index += 1;
        if self.cur_index >= BLOCK_SIZE {
            self.cur_index = 0;
            self.cur_block = (self.cur_block + 1) % self.blocks.len();
        }
    }

    /// Adds an identifier. `exists` reports whether an id is still live;
    /// dead entries are overwritten in place.
    pub fn add(&mut self, id: T, exists: impl Fn(&T) -> bool) -> Result<()> {
        let mut conflicts = [(0usize, 0usize); PROBES];
        for probe in 0..PROBES {
            let pos = (self.cur_block, self.cur_index);
            self.forward();
            let slot = &mut self.blocks[pos.0][pos.1];
            match slot {
                Some(existing) if exists(existing) => conflicts[probe] = pos,
                _ => {
                    *slot = Some(id);
                    return Ok(());
                }
            }
        }

        // Crowded: split the current block and scatter the conflicting ids
        // into the freed tail so later probes through this area find gaps.
        if self.blocks.len() * BLOCK_SIZE >= self.max_entries {
            return Err(Error::with_context(
                ErrorKind::ResourceExhausted,
                "identifier list is full of live ids",
            ));
        }
        let cur = self.cur_block;
        let split_at = self.cur_index;
        let mut fresh = empty_block();
        for slot in split_at..BLOCK_SIZE {
            fresh[slot] = self.blocks[cur][slot].take();
        }
        self.blocks.insert(cur + 1, fresh);

        // Conflict positions in blocks past the insertion point shifted.
        for (block, _slot) in &mut conflicts {
            if *block > cur {
                *block += 1;
            }
        }

        // Re-space two of the conflicts into the freed tail, one gap apart.
        // Each move leaves a dead slot behind, so the retry below is
        // guaranteed to find a gap within its probe window.
        let mut write = split_at;
        for &(block, slot) in &conflicts[PROBES - 2..] {
            if write >= BLOCK_SIZE {
                break;
            }
            self.blocks[cur][write] = self.blocks[block][slot].take();
            write += 2;
        }
        self.cur_block = cur;
        self.cur_index = split_at;
        self.add(id, exists)
    }

    /// Applies `f` to every identifier that is still live.
    pub fn for_each(&self, exists: impl Fn(&T) -> bool, mut f: impl FnMut(&T)) {
        for block in &self.blocks {
            for slot in block.iter().flatten() {
                if exists(slot) {
                    f(slot);
                }
            }
        }
    }

    /// Total slots currently allocated (live and dead alike).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.blocks.len() * BLOCK_SIZE
    }
}

impl<T: Copy + PartialEq> std::fmt::Debug for ListOfAbaFreeId<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ListOfAbaFreeId({} blocks)", self.blocks.len())
    }
}
