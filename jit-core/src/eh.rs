//! EH Region Tree and Region Graph
//!
//! Nested try/handler/filter descriptors and region-containment queries
//! (`spec.md` §3, §4.3).

use crate::cfg::BlockId;

/// Index of an [`EhRegion`] in `Compiler::eh_regions`. Regions are stored
/// outer-first so a smaller id is never nested inside a larger one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EhRegionId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Catch,
    Filter,
    Fault,
    Finally,
    /// A `fault` region that began life as a `finally` (some front ends
    /// rewrite `finally` to `fault` when the handler cannot observe the
    /// exception object).
    FaultWasFinally,
}

/// A contiguous-at-construction `[first, last]` block range, inclusive.
/// After funclet extraction a try range may become non-contiguous; this
/// crate tracks that with `non_contiguous` rather than silently allowing
/// callers to assume contiguity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub first: BlockId,
    pub last: BlockId,
    pub non_contiguous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EhRegion {
    pub id: EhRegionId,
    pub try_range: BlockRange,
    pub handler_range: BlockRange,
    pub filter_range: Option<BlockRange>,
    pub handler_kind: HandlerKind,
    /// Forms a forest; `None` for a top-level (not further enclosed) region.
    pub enclosing_try: Option<EhRegionId>,
    /// Precomputed `[lo, hi)` nesting interval over a region pre-order
    /// numbering, for O(1) `region_contains`.
    nesting_lo: u32,
    nesting_hi: u32,
}

/// Flat, outer-first array of EH descriptors forming a forest via
/// `enclosing_try` pointers, plus the pre-order nesting intervals used for
/// O(1) containment queries.
#[derive(Debug, Clone, Default)]
pub struct EhTable {
    regions: Vec<EhRegion>,
}

impl EhTable {
    pub fn new() -> Self {
        Self { regions: Vec::new() }
    }

    /// Adds a region. Callers must add in outer-first order and then call
    /// [`Self::recompute_nesting`] once the whole table is built, mirroring
    /// the source's "nesting intervals computed once after import" shape.
    pub fn push(&mut self, mut region: EhRegion) -> EhRegionId {
        let id = EhRegionId(self.regions.len() as u32);
        region.id = id;
        self.regions.push(region);
        id
    }

    pub fn get(&self, id: EhRegionId) -> &EhRegion {
        &self.regions[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EhRegion> {
        self.regions.iter()
    }

    /// Recomputes the `[lo, hi)` nesting interval of every region with a DFS
    /// preorder walk of the `enclosing_try` forest. A flat running counter
    /// over `0..n` is not equivalent to this: it only produces correct
    /// intervals when regions happen to be stored in contiguous DFS
    /// preorder, which outer-first id order does not guarantee once a
    /// sibling (e.g. id 1) precedes a region nested under an earlier sibling
    /// (e.g. id 2 nested in id 0) -- a legal arrangement under "smaller id
    /// never nested inside larger", but not a preorder one.
    pub fn recompute_nesting(&mut self) {
        let n = self.regions.len();
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut roots = Vec::new();
        for (i, r) in self.regions.iter().enumerate() {
            match r.enclosing_try {
                Some(parent) => children[parent.0 as usize].push(i),
                None => roots.push(i),
            }
        }

        fn visit(i: usize, children: &[Vec<usize>], next: &mut u32, lo: &mut [u32], hi: &mut [u32]) {
            lo[i] = *next;
            *next += 1;
            for &child in &children[i] {
                visit(child, children, next, lo, hi);
            }
            hi[i] = *next;
        }

        let mut next = 0u32;
        let mut lo = vec![0u32; n];
        let mut hi = vec![0u32; n];
        for root in roots {
            visit(root, &children, &mut next, &mut lo, &mut hi);
        }

        for i in 0..n {
            self.regions[i].nesting_lo = lo[i];
            self.regions[i].nesting_hi = hi[i];
        }
    }

    /// O(1) containment query once intervals are computed: does `outer`
    /// properly or improperly contain `inner`?
    pub fn region_contains(&self, outer: EhRegionId, inner: EhRegionId) -> bool {
        let o = &self.regions[outer.0 as usize];
        let i = &self.regions[inner.0 as usize];
        o.nesting_lo <= i.nesting_lo && i.nesting_hi <= o.nesting_hi
    }

    /// Verifies every child's interval is contained in its parent's and
    /// that siblings at the same nesting level are non-overlapping and
    /// ordered -- the structural check the region graph exposes for the
    /// consistency checker.
    pub fn verify_nesting(&self) -> Result<(), String> {
        for r in &self.regions {
            if let Some(parent) = r.enclosing_try {
                if !self.region_contains(parent, r.id) {
                    return Err(format!(
                        "EH region {} not contained in its enclosing region {}",
                        r.id.0, parent.0
                    ));
                }
            }
        }
        // Sibling non-overlap: any two regions sharing a parent must have
        // disjoint, non-crossing intervals.
        for a in &self.regions {
            for b in &self.regions {
                if a.id == b.id || a.enclosing_try != b.enclosing_try {
                    continue;
                }
                let disjoint = a.nesting_hi <= b.nesting_lo || b.nesting_hi <= a.nesting_lo;
                if !disjoint {
                    return Err(format!(
                        "EH regions {} and {} (siblings) overlap",
                        a.id.0, b.id.0
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(first: u32, last: u32) -> BlockRange {
        BlockRange { first: BlockId(first), last: BlockId(last), non_contiguous: false }
    }

    fn mk_region(id: u32, first: u32, last: u32, enclosing: Option<u32>) -> EhRegion {
        EhRegion {
            id: EhRegionId(id),
            try_range: range(first, last),
            handler_range: range(last + 1, last + 1),
            filter_range: None,
            handler_kind: HandlerKind::Catch,
            enclosing_try: enclosing.map(EhRegionId),
            nesting_lo: 0,
            nesting_hi: 0,
        }
    }

    #[test]
    fn nested_regions_report_containment() {
        let mut table = EhTable::new();
        table.push(mk_region(0, 0, 10, None));
        table.push(mk_region(1, 2, 6, Some(0)));
        table.recompute_nesting();

        assert!(table.region_contains(EhRegionId(0), EhRegionId(1)));
        assert!(table.region_contains(EhRegionId(0), EhRegionId(0)));
        assert!(!table.region_contains(EhRegionId(1), EhRegionId(0)));
        assert!(table.verify_nesting().is_ok());
    }

    #[test]
    fn disjoint_siblings_do_not_contain_each_other() {
        let mut table = EhTable::new();
        table.push(mk_region(0, 0, 20, None));
        table.push(mk_region(1, 1, 5, Some(0)));
        table.push(mk_region(2, 6, 10, Some(0)));
        table.recompute_nesting();

        assert!(!table.region_contains(EhRegionId(1), EhRegionId(2)));
        assert!(!table.region_contains(EhRegionId(2), EhRegionId(1)));
        assert!(table.verify_nesting().is_ok());
    }

    /// Two siblings (0, 1) followed by a region (2) nested inside the
    /// first sibling. This is legal outer-first ordering -- 2's enclosing
    /// region (0) has a smaller id -- but it is not a contiguous DFS
    /// preorder: a plain running counter over id order would place 2's
    /// interval after 1's, disjoint from 0's, and `region_contains(0, 2)`
    /// would wrongly report `false`.
    #[test]
    fn sibling_then_nested_child_is_still_contained() {
        let mut table = EhTable::new();
        table.push(mk_region(0, 0, 10, None));
        table.push(mk_region(1, 11, 20, None));
        table.push(mk_region(2, 2, 6, Some(0)));
        table.recompute_nesting();

        assert!(table.region_contains(EhRegionId(0), EhRegionId(2)));
        assert!(!table.region_contains(EhRegionId(1), EhRegionId(2)));
        assert!(!table.region_contains(EhRegionId(0), EhRegionId(1)));
        assert!(table.verify_nesting().is_ok());
    }
}
