//! # Loop Analysis
//!
//! Finds, for every block, the innermost natural loop header enclosing it and
//! that header's preheader.
//!
//! A DFS from the entry records discovery times. An edge to a block that is
//! still on the DFS path is a back edge and its target becomes a candidate
//! header of the source. Candidate headers flow upward: a block inherits
//! every still-open header of the blocks it reaches, through tree edges when
//! a child finishes and through cross or forward edges when the target is
//! already finished.
//!
//! A header that does not dominate every block it nominally contains is
//! irreducible and disqualified, together with every header nested in its
//! loop. Blocks whose only candidates were disqualified still count as being
//! in a loop but report no header.

use crate::cfg;
use crate::dominance::DominanceInfo;
use crate::ir::{Module, ValueId};
use indexmap::IndexSet;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct LoopAnalysis {
    discovery: HashMap<ValueId, u32>,
    /// Candidate headers of each block.
    headers: HashMap<ValueId, IndexSet<ValueId>>,
    bad_headers: HashSet<ValueId>,
    preheaders: HashMap<ValueId, Option<ValueId>>,
}

impl LoopAnalysis {
    pub fn new(module: &Module, func: ValueId, dom: &DominanceInfo) -> Self {
        let mut analysis = LoopAnalysis {
            discovery: HashMap::new(),
            headers: HashMap::new(),
            bad_headers: HashSet::new(),
            preheaders: HashMap::new(),
        };
        if let Some(entry) = module.entry_block(func) {
            analysis.discover(module, entry);
            analysis.disqualify_irreducible(dom);
            analysis.compute_preheaders(module, dom);
        }
        log::debug!(
            "[LOOPS] {}: {} blocks in loops, {} bad headers",
            module.function_name(func),
            analysis.headers.values().filter(|h| !h.is_empty()).count(),
            analysis.bad_headers.len()
        );
        analysis
    }

    fn discover(&mut self, module: &Module, entry: ValueId) {
        let mut time = 0u32;
        let mut finished: HashSet<ValueId> = HashSet::new();
        self.discovery.insert(entry, time);
        time += 1;
        let mut stack: Vec<(ValueId, Vec<ValueId>, usize)> = vec![(entry, cfg::successors(module, entry), 0)];

        while let Some(top) = stack.len().checked_sub(1) {
            let u = stack[top].0;
            let next = stack[top].2;
            if next == stack[top].1.len() {
                finished.insert(u);
                stack.pop();
                if let Some(parent) = stack.last().map(|t| t.0) {
                    let open = self.open_headers(u, &finished);
                    self.add_headers(parent, open);
                }
                continue;
            }
            let v = stack[top].1[next];
            stack[top].2 += 1;

            if !self.discovery.contains_key(&v) {
                // Tree edge.
                self.discovery.insert(v, time);
                time += 1;
                stack.push((v, cfg::successors(module, v), 0));
            } else if !finished.contains(&v) {
                // Back edge: v is still on the DFS path.
                self.headers.entry(u).or_default().insert(v);
            } else {
                // Forward or cross edge.
                let open = self.open_headers(v, &finished);
                self.add_headers(u, open);
            }
        }
    }

    fn open_headers(&self, bb: ValueId, finished: &HashSet<ValueId>) -> Vec<ValueId> {
        self.headers
            .get(&bb)
            .map(|hs| hs.iter().copied().filter(|h| !finished.contains(h)).collect())
            .unwrap_or_default()
    }

    fn add_headers(&mut self, bb: ValueId, headers: Vec<ValueId>) {
        if headers.is_empty() {
            return;
        }
        self.headers.entry(bb).or_default().extend(headers);
    }

    fn disqualify_irreducible(&mut self, dom: &DominanceInfo) {
        for (&bb, headers) in &self.headers {
            for &h in headers {
                if !dom.dominates(h, bb) {
                    self.bad_headers.insert(h);
                }
            }
        }
        // Anything nested in a bad loop is bad too.
        let mut changed = true;
        while changed {
            changed = false;
            for (&bb, headers) in &self.headers {
                if !self.bad_headers.contains(&bb) && headers.iter().any(|h| self.bad_headers.contains(h)) {
                    self.bad_headers.insert(bb);
                    changed = true;
                }
            }
        }
    }

    /// The immediate dominator of a header is its preheader when it is the
    /// only predecessor entering the loop from outside.
    fn compute_preheaders(&mut self, module: &Module, dom: &DominanceInfo) {
        let good: IndexSet<ValueId> = self
            .headers
            .values()
            .flat_map(|hs| hs.iter().copied())
            .filter(|h| !self.bad_headers.contains(h))
            .collect();
        for header in good {
            let outside: IndexSet<ValueId> = cfg::predecessors(module, header)
                .into_iter()
                .filter(|&p| !dom.dominates(header, p))
                .collect();
            let preheader = match (dom.idom(header), outside.len()) {
                (Some(idom), 1) if outside.contains(&idom) && dom.properly_dominates(idom, header) => Some(idom),
                _ => None,
            };
            self.preheaders.insert(header, preheader);
        }
    }

    /// Whether `bb` lies inside any loop, analyzable or not.
    pub fn is_block_in_loop(&self, bb: ValueId) -> bool {
        self.headers.get(&bb).map_or(false, |hs| !hs.is_empty())
    }

    /// Innermost analyzable loop header enclosing `bb`.
    pub fn loop_header(&self, bb: ValueId) -> Option<ValueId> {
        self.headers
            .get(&bb)?
            .iter()
            .copied()
            .filter(|h| !self.bad_headers.contains(h))
            .max_by_key(|h| self.discovery.get(h).copied().unwrap_or(0))
    }

    /// Preheader of the innermost loop enclosing `bb`.
    pub fn loop_preheader(&self, bb: ValueId) -> Option<ValueId> {
        let header = self.loop_header(bb)?;
        self.preheaders.get(&header).copied().flatten()
    }

    pub fn is_bad_header(&self, bb: ValueId) -> bool {
        self.bad_headers.contains(&bb)
    }
}
