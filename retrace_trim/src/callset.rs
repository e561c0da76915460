use anyhow::{ensure, Context};

use retrace_model::CallNo;

/// Level cap of the skip list. Level L is used with probability
/// 1/4^(L-1), so sixteen levels comfortably cover any realistic range
/// count.
pub const MAX_LEVEL: usize = 16;

/// Arena index of the sentinel head node.
const HEAD: u32 = 0;

/// Empty forward slot.
const NIL: u32 = u32::MAX;

/// A closed interval of kept call numbers plus its forward slots, one per
/// level the node participates in.
#[derive(Debug)]
struct CallRange {
    first: CallNo,
    last: CallNo,
    links: Vec<u32>,
}

/// Deterministic PRNG driving level selection. Explicit and per-set so
/// list shapes reproduce run to run.
#[derive(Debug, Clone)]
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }
}

const DEFAULT_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Set of call numbers stored as non-overlapping, non-adjacent ranges in
/// a skip list.
///
/// Invariants: ranges appear in strictly increasing order at every level;
/// an insertion that touches an existing range extends it, and an
/// insertion that closes the gap between two ranges merges them, so no
/// two stored ranges could be expressed as one. Nodes live in an arena
/// (`Vec` slots linked by index); freed nodes go on a free list and are
/// reused.
#[derive(Debug)]
pub struct CallSet {
    nodes: Vec<CallRange>,
    free: Vec<u32>,
    /// Levels currently in use; rises by at most one per insertion.
    max_level: usize,
    ranges: usize,
    rng: Lcg,
}

impl Default for CallSet {
    fn default() -> Self {
        Self::new()
    }
}

impl CallSet {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Seed the level PRNG explicitly, for reproducible list shapes in
    /// tests and benchmarks.
    pub fn with_seed(seed: u64) -> Self {
        CallSet {
            nodes: vec![CallRange {
                first: 0,
                last: 0,
                links: vec![NIL; MAX_LEVEL],
            }],
            free: Vec::new(),
            max_level: 1,
            ranges: 0,
            rng: Lcg(seed),
        }
    }

    /// Parse the trimming CLI's call-set syntax: comma-separated call
    /// numbers, closed ranges `4-9`, and open tails `100-`.
    pub fn from_spec(spec: &str) -> anyhow::Result<CallSet> {
        let mut set = CallSet::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((lo, hi)) = part.split_once('-') {
                let first: CallNo = lo
                    .trim()
                    .parse()
                    .with_context(|| format!("bad call range start in {part:?}"))?;
                let last: CallNo = if hi.trim().is_empty() {
                    CallNo::MAX
                } else {
                    hi.trim()
                        .parse()
                        .with_context(|| format!("bad call range end in {part:?}"))?
                };
                ensure!(first <= last, "backwards call range {part:?}");
                set.add_range(first, last);
            } else {
                set.add(
                    part.parse()
                        .with_context(|| format!("bad call number {part:?}"))?,
                );
            }
        }
        Ok(set)
    }

    /// Number of stored ranges (not calls).
    pub fn range_count(&self) -> usize {
        self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges == 0
    }

    /// Whether `call_no` was inserted, directly or inside a merged range.
    pub fn contains(&self, call_no: CallNo) -> bool {
        let mut cur = HEAD;
        for level in (0..self.max_level).rev() {
            loop {
                let next = self.nodes[cur as usize].links[level];
                if next != NIL && self.nodes[next as usize].last < call_no {
                    cur = next;
                } else {
                    break;
                }
            }
        }
        let candidate = self.nodes[cur as usize].links[0];
        candidate != NIL
            && self.nodes[candidate as usize].first <= call_no
            && call_no <= self.nodes[candidate as usize].last
    }

    /// Insert one call number.
    pub fn add(&mut self, call_no: CallNo) {
        let update = self.find_update(call_no);
        let pred = update[0];
        let next = self.nodes[pred as usize].links[0];

        // Touches the predecessor: extend it upward, and close the gap to
        // the follower if this call was the last number between them.
        if pred != HEAD && call_no > 0 && self.nodes[pred as usize].last == call_no - 1 {
            self.nodes[pred as usize].last = call_no;
            if next != NIL
                && call_no < CallNo::MAX
                && self.nodes[next as usize].first == call_no + 1
            {
                self.nodes[pred as usize].last = self.nodes[next as usize].last;
                self.remove_node(next);
            }
            return;
        }

        if next != NIL {
            // Already inside the follower.
            if self.nodes[next as usize].first <= call_no {
                return;
            }
            // Touches the follower: extend it downward.
            if call_no < CallNo::MAX && self.nodes[next as usize].first == call_no + 1 {
                self.nodes[next as usize].first = call_no;
                return;
            }
        }

        self.insert_node(call_no, call_no, &update);
    }

    /// Insert a closed range of call numbers at once.
    pub fn add_range(&mut self, first: CallNo, last: CallNo) {
        debug_assert!(first <= last);
        let update = self.find_update(first);
        let pred = update[0];
        let next = self.nodes[pred as usize].links[0];

        if pred != HEAD && first > 0 && self.nodes[pred as usize].last == first - 1 {
            self.nodes[pred as usize].last = self.nodes[pred as usize].last.max(last);
            self.absorb_successors(pred);
            return;
        }

        if next != NIL && self.nodes[next as usize].first <= last.saturating_add(1) {
            self.nodes[next as usize].first = self.nodes[next as usize].first.min(first);
            self.nodes[next as usize].last = self.nodes[next as usize].last.max(last);
            self.absorb_successors(next);
            return;
        }

        self.insert_node(first, last, &update);
    }

    // ── internals ──────────────────────────────────────────────────────────

    /// Predecessor per level for an insertion keyed at `call_no`: the last
    /// node at each level whose range ends before it.
    fn find_update(&self, call_no: CallNo) -> [u32; MAX_LEVEL] {
        let mut update = [HEAD; MAX_LEVEL];
        let mut cur = HEAD;
        for level in (0..self.max_level).rev() {
            loop {
                let next = self.nodes[cur as usize].links[level];
                if next != NIL && self.nodes[next as usize].last < call_no {
                    cur = next;
                } else {
                    break;
                }
            }
            update[level] = cur;
        }
        update
    }

    /// Level for a fresh node, in `[1, MAX_LEVEL)`: two draws combined so
    /// each additional level survives with probability 1/4.
    fn random_level(&mut self) -> usize {
        let mut bits = (self.rng.next() >> 32) & (self.rng.next() >> 32);
        let mut level = 1;
        while bits & 1 == 1 && level + 1 < MAX_LEVEL {
            level += 1;
            bits >>= 1;
        }
        level
    }

    fn insert_node(&mut self, first: CallNo, last: CallNo, update: &[u32; MAX_LEVEL]) {
        let mut level = self.random_level();
        if level > self.max_level {
            level = self.max_level + 1;
            self.max_level = level;
        }
        let idx = self.alloc(first, last, level);
        for l in 0..level {
            let pred = update[l] as usize;
            self.nodes[idx as usize].links[l] = self.nodes[pred].links[l];
            self.nodes[pred].links[l] = idx;
        }
        self.ranges += 1;
    }

    /// Fold every follower of `node` that now overlaps or touches it into
    /// `node`.
    fn absorb_successors(&mut self, node: u32) {
        loop {
            let next = self.nodes[node as usize].links[0];
            if next == NIL {
                return;
            }
            let reach = self.nodes[node as usize].last.saturating_add(1);
            if self.nodes[next as usize].first > reach {
                return;
            }
            self.nodes[node as usize].last = self.nodes[node as usize]
                .last
                .max(self.nodes[next as usize].last);
            self.remove_node(next);
        }
    }

    /// Splice `node` out of every level it participates in and recycle its
    /// slot. Predecessors are re-searched by range start, which stays
    /// valid even while a neighbor's extended `last` temporarily overlaps.
    fn remove_node(&mut self, node: u32) {
        let first = self.nodes[node as usize].first;
        let mut cur = HEAD;
        for level in (0..self.max_level).rev() {
            loop {
                let next = self.nodes[cur as usize].links[level];
                if next != NIL && next != node && self.nodes[next as usize].first < first {
                    cur = next;
                } else {
                    break;
                }
            }
            if level < self.nodes[node as usize].links.len()
                && self.nodes[cur as usize].links[level] == node
            {
                self.nodes[cur as usize].links[level] = self.nodes[node as usize].links[level];
            }
        }
        self.free.push(node);
        self.ranges -= 1;
    }

    fn alloc(&mut self, first: CallNo, last: CallNo, level: usize) -> u32 {
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.nodes[idx as usize];
            slot.first = first;
            slot.last = last;
            slot.links.clear();
            slot.links.resize(level, NIL);
            idx
        } else {
            self.nodes.push(CallRange {
                first,
                last,
                links: vec![NIL; level],
            });
            (self.nodes.len() - 1) as u32
        }
    }
}
