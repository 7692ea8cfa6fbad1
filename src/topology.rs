//! Communication topology and operation program of the dual-tree reduction.
//!
//! The global index tree fixes where every pairwise addition happens; this
//! module derives, for one process, everything that follows from an
//! arbitrary contiguous partitioning of the leaves:
//!
//! - the minimal set of *local roots* whose fully-owned subtrees tile the
//!   process's region,
//! - the *outgoing* partial sums it ships upward, and the single comm-parent
//!   that receives them,
//! - the comm-children it receives partial sums from, in ascending array
//!   order so incoming values are contiguous and ascending in the inbox,
//! - the postfix PUSH/REDUCE *operation program* that assembles those values
//!   in the exact pairing order of the index tree.
//!
//! A process cannot know its outgoing set from its own region alone: values
//! forwarded by comm-children may pass through unjoined. The topology
//! therefore replays the whole coordinate flow over the permuted regions,
//! walking processes from the back of the array order to the front. The
//! replay is a pure function of (n, regions), so every rank derives the
//! identical structure.

use crate::error::{CanopyError, Result};
use crate::partition::Region;
use crate::tree;
use crate::types::TreeCoordinate;

/// One token of the postfix operation program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Pop the next value off the inbox and push it onto the stack.
    Push,
    /// Pop two values b, a and push a + b.
    Reduce,
}

/// Compiled postfix program plus the local subtree roots it consumes first.
#[derive(Debug, Clone)]
pub struct OperationProgram {
    pub ops: Vec<Operation>,
    pub local_coords: Vec<TreeCoordinate>,
}

impl OperationProgram {
    /// Deepest the evaluation stack can get; used to pre-size it.
    pub fn max_stack_size(&self) -> usize {
        let mut max = 0usize;
        let mut size = 0usize;
        for op in &self.ops {
            match op {
                Operation::Push => size += 1,
                Operation::Reduce => size -= 1,
            }
            max = max.max(size);
        }
        max
    }
}

/// Per-process view of the dual tree for a fixed (n, partitioning).
#[derive(Debug, Clone)]
pub struct DualTreeTopology {
    array_rank: u32,
    global_size: u64,
    local: Region,
    local_coords: Vec<TreeCoordinate>,
    outgoing: Vec<TreeCoordinate>,
    comm_parent: Option<u32>,
    comm_children: Vec<u32>,
}

impl DualTreeTopology {
    /// Build the topology for the process at `array_rank`, given all regions
    /// in array order. `regions[0]` must own global index 0 unless n == 0.
    pub fn new(array_rank: u32, regions: &[Region], global_size: u64) -> Result<Self> {
        let p = regions.len();
        debug_assert!((array_rank as usize) < p);

        let mut outgoing_of: Vec<Vec<TreeCoordinate>> = vec![Vec::new(); p];
        let mut incoming_of: Vec<Vec<TreeCoordinate>> = vec![Vec::new(); p];
        let mut comm_parent_of: Vec<Option<u32>> = vec![None; p];
        let mut comm_children_of: Vec<Vec<u32>> = vec![Vec::new(); p];

        // Ascending starts of the non-empty regions, for owner lookups
        // inside the replay.
        let starts: Vec<(u64, u32)> = {
            let mut s: Vec<(u64, u32)> = regions
                .iter()
                .enumerate()
                .filter(|(_, r)| !r.is_empty())
                .map(|(a, r)| (r.start, a as u32))
                .collect();
            s.sort_unstable();
            s
        };
        let owner_of = |i: u64| -> u32 {
            let at = starts.partition_point(|&(start, _)| start <= i);
            debug_assert!(at > 0);
            starts[at - 1].1
        };

        // Replay the coordinate flow from the last process to the first.
        // By the time process a runs, every later process has already
        // deposited its outgoing set into incoming_of[a].
        for a in (0..p).rev() {
            let region = regions[a];
            if region.is_empty() {
                continue;
            }

            let mut coords = local_roots(region, global_size);
            coords.extend(incoming_of[a].iter().copied());
            coords.sort_unstable();

            let (_, stack) = compile(&coords, global_size);

            if a == 0 {
                if stack.len() != 1 {
                    return Err(CanopyError::OutgoingMismatch {
                        expected: 1,
                        actual: stack.len(),
                    });
                }
                outgoing_of[0] = stack;
            } else {
                // The topmost outgoing node has the leftmost-reaching
                // parent; its owner receives everything this process ships.
                let dest = stack
                    .iter()
                    .map(|c| tree::parent(c.index))
                    .min()
                    .expect("non-empty region always yields at least one coordinate");
                let parent_pos = owner_of(dest);
                debug_assert!((parent_pos as usize) < a);
                comm_parent_of[a] = Some(parent_pos);
                comm_children_of[parent_pos as usize].push(a as u32);
                incoming_of[parent_pos as usize].extend(stack.iter().copied());
                outgoing_of[a] = stack;
            }
        }

        let me = array_rank as usize;
        let mut comm_children = std::mem::take(&mut comm_children_of[me]);
        comm_children.sort_unstable();

        Ok(Self {
            array_rank,
            global_size,
            local: regions[me],
            local_coords: if regions[me].is_empty() {
                Vec::new()
            } else {
                local_roots(regions[me], global_size)
            },
            outgoing: std::mem::take(&mut outgoing_of[me]),
            comm_parent: comm_parent_of[me],
            comm_children,
        })
    }

    /// Array position of this process.
    pub fn array_rank(&self) -> u32 {
        self.array_rank
    }

    /// Whether this process sits at array position 0 and produces the result.
    pub fn is_root(&self) -> bool {
        self.array_rank == 0
    }

    pub fn global_size(&self) -> u64 {
        self.global_size
    }

    /// This process's region in global index space.
    pub fn local_region(&self) -> Region {
        self.local
    }

    /// Minimal fully-owned subtree roots tiling the local region, ascending.
    pub fn local_coords(&self) -> &[TreeCoordinate] {
        &self.local_coords
    }

    /// Partial sums shipped to the comm-parent, ascending by global index.
    /// For the root this holds the single coordinate of the final result.
    pub fn outgoing(&self) -> &[TreeCoordinate] {
        &self.outgoing
    }

    /// Array position of the comm-parent; None for the root and for
    /// processes with an empty region.
    pub fn comm_parent(&self) -> Option<u32> {
        self.comm_parent
    }

    /// Array positions of the comm-children, ascending.
    pub fn comm_children(&self) -> &[u32] {
        &self.comm_children
    }

    /// Compile the operation program from this process's local roots and the
    /// coordinates announced by its comm-children.
    ///
    /// The final stack must line up with the outgoing set derived at
    /// construction; a mismatch means the peers announced a different
    /// schedule than the replay predicted.
    pub fn compute_operations(&self, incoming: &[TreeCoordinate]) -> Result<OperationProgram> {
        let mut coords: Vec<TreeCoordinate> = self
            .local_coords
            .iter()
            .chain(incoming.iter())
            .copied()
            .collect();
        coords.sort_unstable();

        let (ops, stack) = compile(&coords, self.global_size);
        if stack != self.outgoing {
            return Err(CanopyError::OutgoingMismatch {
                expected: self.outgoing.len(),
                actual: stack.len(),
            });
        }
        Ok(OperationProgram {
            ops,
            local_coords: self.local_coords.clone(),
        })
    }
}

/// Greedy left-to-right decomposition of a region into the minimal set of
/// fully-owned subtrees: at each position take the tallest node the index
/// alignment allows whose (clipped) span still fits the region.
fn local_roots(region: Region, n: u64) -> Vec<TreeCoordinate> {
    let mut coords = Vec::new();
    let mut x = region.start;
    while x < region.end() {
        let align_max = if x == 0 {
            tree::ceil_log2(n)
        } else {
            x.trailing_zeros()
        };
        let y = if region.end() == n {
            // Clipping against n absorbs the ragged right edge, so the
            // alignment alone bounds the height.
            align_max
        } else {
            align_max.min(tree::floor_log2(region.end() - x))
        };
        coords.push(TreeCoordinate::new(x, y));
        x = tree::span_end(x, y, n);
    }
    coords
}

/// Whether the subtree `b` is exactly the right sibling completing `a` one
/// level up, taking the clipped right edge into account.
fn joinable(a: TreeCoordinate, b: TreeCoordinate, n: u64) -> bool {
    if a.height >= 63 {
        return false;
    }
    let aligned = a.index == 0
        || 1u64
            .checked_shl(a.height + 1)
            .is_some_and(|m| a.index % m == 0);
    aligned
        && b.index == a.index + (1u64 << a.height)
        && b.span_end(n) == tree::span_end(a.index, a.height + 1, n)
}

/// Single pass over coordinates sorted by global index: every coordinate is
/// pushed, and whenever the two topmost stack entries form a sibling pair
/// they are reduced, exactly like binary carry propagation. Returns the
/// token stream and the surviving (maximal) coordinates.
fn compile(coords: &[TreeCoordinate], n: u64) -> (Vec<Operation>, Vec<TreeCoordinate>) {
    let mut ops = Vec::with_capacity(coords.len() * 2);
    let mut stack: Vec<TreeCoordinate> = Vec::new();
    for &c in coords {
        ops.push(Operation::Push);
        stack.push(c);
        while stack.len() >= 2 {
            let b = stack[stack.len() - 1];
            let a = stack[stack.len() - 2];
            if !joinable(a, b, n) {
                break;
            }
            stack.pop();
            stack.pop();
            stack.push(TreeCoordinate::new(a.index, a.height + 1));
            ops.push(Operation::Reduce);
        }
    }
    (ops, stack)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regions(bounds: &[(u64, u64)]) -> Vec<Region> {
        bounds.iter().map(|&(s, n)| Region::new(s, n)).collect()
    }

    #[test]
    fn test_local_roots_aligned() {
        assert_eq!(
            local_roots(Region::new(0, 8), 8),
            vec![TreeCoordinate::new(0, 3)]
        );
        assert_eq!(
            local_roots(Region::new(4, 4), 16),
            vec![TreeCoordinate::new(4, 2)]
        );
    }

    #[test]
    fn test_local_roots_unaligned() {
        // [5, 9) of n = 16: leaf 5, pair (6, 7), leaf 8.
        assert_eq!(
            local_roots(Region::new(5, 4), 16),
            vec![
                TreeCoordinate::new(5, 0),
                TreeCoordinate::new(6, 1),
                TreeCoordinate::new(8, 0),
            ]
        );
    }

    #[test]
    fn test_local_roots_ragged_tail() {
        // The last region reaches n, so clipping lets it take full-height
        // nodes: (8, 3) covers just [8, 9).
        assert_eq!(
            local_roots(Region::new(8, 1), 9),
            vec![TreeCoordinate::new(8, 3)]
        );
        assert_eq!(
            local_roots(Region::new(0, 9), 9),
            vec![TreeCoordinate::new(0, 4)]
        );
    }

    #[test]
    fn test_compile_balanced() {
        let coords: Vec<_> = (0..4).map(|i| TreeCoordinate::new(i, 0)).collect();
        let (ops, stack) = compile(&coords, 4);
        use Operation::{Push, Reduce};
        assert_eq!(
            ops,
            vec![Push, Push, Reduce, Push, Push, Reduce, Reduce]
        );
        assert_eq!(stack, vec![TreeCoordinate::new(0, 2)]);
    }

    #[test]
    fn test_compile_waits_for_gap() {
        // (0,3) and (8,2) cannot join until (12,2) closes the right half.
        let coords = vec![
            TreeCoordinate::new(0, 3),
            TreeCoordinate::new(8, 2),
            TreeCoordinate::new(12, 2),
        ];
        let (_, stack) = compile(&coords, 16);
        assert_eq!(stack, vec![TreeCoordinate::new(0, 4)]);
    }

    #[test]
    fn test_compile_clipped_join() {
        let coords = vec![TreeCoordinate::new(0, 3), TreeCoordinate::new(8, 0)];
        let (_, stack) = compile(&coords, 9);
        assert_eq!(stack, vec![TreeCoordinate::new(0, 4)]);
    }

    #[test]
    fn test_single_process() {
        let topo = DualTreeTopology::new(0, &regions(&[(0, 8)]), 8).unwrap();
        assert!(topo.is_root());
        assert_eq!(topo.local_coords(), &[TreeCoordinate::new(0, 3)]);
        assert_eq!(topo.outgoing(), &[TreeCoordinate::new(0, 3)]);
        assert!(topo.comm_children().is_empty());
        assert_eq!(topo.comm_parent(), None);

        let program = topo.compute_operations(&[]).unwrap();
        assert_eq!(program.ops, vec![Operation::Push]);
        assert_eq!(program.max_stack_size(), 1);
    }

    #[test]
    fn test_even_four_way_chain() {
        let rs = regions(&[(0, 4), (4, 4), (8, 4), (12, 4)]);

        let t3 = DualTreeTopology::new(3, &rs, 16).unwrap();
        assert_eq!(t3.outgoing(), &[TreeCoordinate::new(12, 2)]);
        assert_eq!(t3.comm_parent(), Some(2));

        let t2 = DualTreeTopology::new(2, &rs, 16).unwrap();
        assert_eq!(t2.comm_children(), &[3]);
        assert_eq!(t2.outgoing(), &[TreeCoordinate::new(8, 3)]);
        assert_eq!(t2.comm_parent(), Some(0));

        let t1 = DualTreeTopology::new(1, &rs, 16).unwrap();
        assert_eq!(t1.outgoing(), &[TreeCoordinate::new(4, 2)]);
        assert_eq!(t1.comm_parent(), Some(0));

        let t0 = DualTreeTopology::new(0, &rs, 16).unwrap();
        assert_eq!(t0.comm_children(), &[1, 2]);
        assert_eq!(t0.outgoing(), &[TreeCoordinate::new(0, 4)]);
    }

    #[test]
    fn test_forwarded_coordinate() {
        // [12, 20) ships both (12,2) and (16,4); their parents live on
        // different processes, and everything flows to the owner of the
        // leftmost parent.
        let rs = regions(&[(0, 4), (4, 4), (8, 4), (12, 8)]);
        let t3 = DualTreeTopology::new(3, &rs, 20).unwrap();
        assert_eq!(
            t3.outgoing(),
            &[TreeCoordinate::new(12, 2), TreeCoordinate::new(16, 4)]
        );
        assert_eq!(t3.comm_parent(), Some(0));

        // [8, 12) holds exactly one boundary subtree of height 2 and ships
        // that single value.
        let t2 = DualTreeTopology::new(2, &rs, 20).unwrap();
        assert_eq!(t2.outgoing(), &[TreeCoordinate::new(8, 2)]);
        assert_eq!(t2.comm_parent(), Some(0));
        assert!(t2.comm_children().is_empty());

        // The root joins (8,2) with the forwarded (12,2) before closing the
        // full tree of height ceil(log2(20)) = 5.
        let t0 = DualTreeTopology::new(0, &rs, 20).unwrap();
        assert_eq!(t0.comm_children(), &[1, 2, 3]);
        let incoming: Vec<_> = [(4u64, 2u32), (8, 2), (12, 2), (16, 4)]
            .iter()
            .map(|&(x, y)| TreeCoordinate::new(x, y))
            .collect();
        let program = t0.compute_operations(&incoming).unwrap();
        assert_eq!(t0.outgoing(), &[TreeCoordinate::new(0, 5)]);
        assert_eq!(
            program.ops.iter().filter(|o| **o == Operation::Push).count(),
            5
        );
    }

    #[test]
    fn test_empty_region_is_detached() {
        let rs = vec![Region::new(0, 4), Region::new(4, 0)];
        let t1 = DualTreeTopology::new(1, &rs, 4).unwrap();
        assert!(t1.local_coords().is_empty());
        assert!(t1.outgoing().is_empty());
        assert_eq!(t1.comm_parent(), None);

        let t0 = DualTreeTopology::new(0, &rs, 4).unwrap();
        assert!(t0.comm_children().is_empty());
    }

    #[test]
    fn test_mismatched_incoming_rejected() {
        let rs = regions(&[(0, 4), (4, 4)]);
        let t0 = DualTreeTopology::new(0, &rs, 8).unwrap();
        // The child announces a coordinate the replay never predicted.
        let err = t0
            .compute_operations(&[TreeCoordinate::new(6, 1)])
            .unwrap_err();
        assert!(matches!(err, CanopyError::OutgoingMismatch { .. }));
    }

    #[test]
    fn test_max_stack_size_matches_hand_count() {
        let rs = regions(&[(0, 4), (4, 4), (8, 4), (12, 8)]);
        let t0 = DualTreeTopology::new(0, &rs, 20).unwrap();
        let incoming: Vec<_> = [(4u64, 2u32), (8, 2), (12, 2), (16, 4)]
            .iter()
            .map(|&(x, y)| TreeCoordinate::new(x, y))
            .collect();
        let program = t0.compute_operations(&incoming).unwrap();
        // (0,3) and (8,2) coexist before (12,2) arrives.
        assert_eq!(program.max_stack_size(), 3);
    }
}
