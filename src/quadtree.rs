// Recursive homogeneity-driven image decomposition
//
// The source keeps a `root` assignment threaded through the recursion
// that never actually gets walked -- the effective tree is just whatever
// `add_node` builds as it goes. We don't reproduce that spurious parent
// pointer: this is a flat arena of nodes built by straight-line
// recursion, and `leaves()` collects them with an explicit depth-first
// walk in {TL, TR, BL, BR} order.
use fusion_utils::region::Bounds;

use crate::config::QuadtreeThresholds;
use crate::frame::Plane;

/// A leaf or internal rectangle plus its gray-range statistic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    pub rect: Bounds,
    pub range: u8,
}

#[derive(Debug)]
struct QuadNode {
    blob: Blob,
    /// Indices into the arena, {TL, TR, BL, BR}. A node is a leaf when
    /// all four are `None`.
    children: Option<[usize; 4]>,
}

/// An arena-indexed quadtree over a single 8-bit plane.
pub struct Quadtree {
    nodes: Vec<QuadNode>,
    root: Option<usize>,
    thresholds: QuadtreeThresholds,
}

impl Quadtree {
    pub fn new(thresholds: QuadtreeThresholds) -> Quadtree {
        Quadtree {
            nodes: Vec::new(),
            root: None,
            thresholds,
        }
    }

    /// Discard the current decomposition; the arena is reused for the
    /// next frame.
    pub fn reset(&mut self) {
        self.nodes.clear();
        self.root = None;
    }

    /// Decompose `plane` over its full extent.
    pub fn decompose(&mut self, plane: &Plane) {
        self.reset();
        let full = Bounds::new(0, 0, plane.height as i32, plane.width as i32);
        let idx = self.build(plane, full);
        self.root = Some(idx);
    }

    fn range_of(plane: &Plane, rect: Bounds) -> u8 {
        let mut lo = 255u8;
        let mut hi = 0u8;
        for y in rect.top..rect.bottom {
            for x in rect.left..rect.right {
                let v = plane.get(x as usize, y as usize);
                lo = lo.min(v);
                hi = hi.max(v);
            }
        }
        hi - lo
    }

    fn build(&mut self, plane: &Plane, rect: Bounds) -> usize {
        let range = Self::range_of(plane, rect);
        let blob = Blob { rect, range };

        let should_split = rect.width() > self.thresholds.min_bw
            && rect.height() > self.thresholds.min_bh
            && range > self.thresholds.min_range;

        let children = if should_split {
            let quads = rect.split();
            let mut idxs = [0usize; 4];
            for (i, q) in quads.iter().enumerate() {
                idxs[i] = self.build(plane, *q);
            }
            Some(idxs)
        } else {
            None
        };

        self.nodes.push(QuadNode { blob, children });
        self.nodes.len() - 1
    }

    /// Depth-first leaf collection in {TL, TR, BL, BR} child order.
    pub fn leaves(&self) -> Vec<Blob> {
        let mut out = Vec::new();
        if let Some(root) = self.root {
            self.collect_leaves(root, &mut out);
        }
        out
    }

    fn collect_leaves(&self, idx: usize, out: &mut Vec<Blob>) {
        let node = &self.nodes[idx];
        match &node.children {
            None => out.push(node.blob),
            Some(children) => {
                for &c in children {
                    self.collect_leaves(c, out);
                }
            }
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
