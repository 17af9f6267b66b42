//! Agglomerative clustering primitives.
//!
//! A linkage is a list of `n - 1` merges sorted by height. Merge `i` creates
//! cluster `n + i`; ids below `n` are the original observations.

use rayon::prelude::*;
use statrs::statistics::Statistics;

use crate::Point;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Merge {
    pub left: usize,
    pub right: usize,
    pub height: f64,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Inconsistency {
    pub mean: f64,
    pub std_dev: f64,
    pub count: usize,
    pub coefficient: f64,
}

/// Upper-triangle distances, row-major, as `(i, j)` with `i < j`.
#[derive(Debug, Clone)]
pub struct CondensedMatrix {
    n: usize,
    values: Vec<f64>,
}

impl CondensedMatrix {
    pub fn euclidean(points: &[Point]) -> Self {
        let n = points.len();
        let values = (0..n)
            .into_par_iter()
            .map(|i| {
                points[i + 1..]
                    .iter()
                    .map(|other| points[i].distance(other))
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();
        Self { n, values }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    fn index(&self, i: usize, j: usize) -> usize {
        let (i, j) = if i < j { (i, j) } else { (j, i) };
        self.n * i - (i * (i + 1)) / 2 + (j - i - 1)
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.values[self.index(i, j)]
    }

    fn set(&mut self, i: usize, j: usize, value: f64) {
        let idx = self.index(i, j);
        self.values[idx] = value;
    }
}

fn ward_update(d_xi: f64, d_yi: f64, d_xy: f64, size_x: usize, size_y: usize, size_i: usize) -> f64 {
    let (nx, ny, ni) = (size_x as f64, size_y as f64, size_i as f64);
    let total = nx + ny + ni;
    (((nx + ni) * d_xi * d_xi + (ny + ni) * d_yi * d_yi - ni * d_xy * d_xy) / total)
        .max(0.0)
        .sqrt()
}

/// Ward linkage by the nearest-neighbour chain algorithm.
pub fn ward_linkage(distances: &CondensedMatrix) -> Vec<Merge> {
    let n = distances.len();
    if n < 2 {
        return Vec::new();
    }

    let mut d = distances.clone();
    let mut size = vec![1usize; n];
    let mut chain: Vec<usize> = Vec::with_capacity(n);
    let mut merges = Vec::with_capacity(n - 1);

    for _ in 0..n - 1 {
        if chain.is_empty() {
            if let Some(first) = size.iter().position(|&s| s > 0) {
                chain.push(first);
            }
        }

        let (x, y, height) = loop {
            let x = chain[chain.len() - 1];
            let previous = (chain.len() > 1).then(|| chain[chain.len() - 2]);
            let mut y = previous.unwrap_or(x);
            let mut current_min = previous.map_or(f64::INFINITY, |p| d.get(x, p));

            for i in 0..n {
                if size[i] == 0 || i == x {
                    continue;
                }
                let dist = d.get(x, i);
                if dist < current_min {
                    current_min = dist;
                    y = i;
                }
            }

            if previous == Some(y) {
                break (x, y, current_min);
            }
            chain.push(y);
        };

        chain.truncate(chain.len() - 2);

        let (x, y) = if x < y { (x, y) } else { (y, x) };
        let (nx, ny) = (size[x], size[y]);
        merges.push(Merge {
            left: x,
            right: y,
            height,
            size: nx + ny,
        });
        size[x] = 0;
        size[y] = nx + ny;

        for i in 0..n {
            let ni = size[i];
            if ni == 0 || i == y {
                continue;
            }
            let updated = ward_update(d.get(i, x), d.get(i, y), height, nx, ny, ni);
            d.set(i, y, updated);
        }
    }

    merges.sort_by(|a, b| a.height.total_cmp(&b.height));
    relabel(merges, n)
}

/// Rewrites merges that refer to representative observations so they refer
/// to cluster ids instead.
fn relabel(mut merges: Vec<Merge>, n: usize) -> Vec<Merge> {
    let mut parent = (0..2 * n - 1).collect::<Vec<_>>();
    let mut sizes = vec![1usize; 2 * n - 1];

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        let mut root = x;
        while parent[root] != root {
            root = parent[root];
        }
        while parent[x] != root {
            let next = parent[x];
            parent[x] = root;
            x = next;
        }
        root
    }

    for (i, merge) in merges.iter_mut().enumerate() {
        let a = find(&mut parent, merge.left);
        let b = find(&mut parent, merge.right);
        let label = n + i;
        merge.left = a.min(b);
        merge.right = a.max(b);
        parent[a] = label;
        parent[b] = label;
        sizes[label] = sizes[a] + sizes[b];
        merge.size = sizes[label];
    }

    merges
}

/// Height statistics of every merge over the merges at most `depth` levels
/// below it, the merge itself included.
pub fn inconsistency(merges: &[Merge], depth: usize) -> Vec<Inconsistency> {
    let n = merges.len() + 1;

    merges
        .iter()
        .enumerate()
        .map(|(i, merge)| {
            let mut heights = Vec::new();
            let mut stack = vec![(i, 1usize)];

            while let Some((node, level)) = stack.pop() {
                let current = &merges[node];
                heights.push(current.height);
                if level < depth {
                    for child in [current.left, current.right] {
                        if child >= n {
                            stack.push((child - n, level + 1));
                        }
                    }
                }
            }

            let count = heights.len();
            let mean = heights.iter().mean();
            let std_dev = if count < 2 {
                0.0
            } else {
                heights.iter().std_dev()
            };
            let coefficient = if std_dev > 0.0 {
                (merge.height - mean) / std_dev
            } else {
                0.0
            };

            Inconsistency {
                mean,
                std_dev,
                count,
                coefficient,
            }
        })
        .collect()
}

/// Flat clusters where every subtree whose largest inconsistency coefficient
/// is at most `threshold` becomes one cluster. Ids start at 1 and follow a
/// left-first traversal from the root.
pub fn flat_clusters_inconsistent(merges: &[Merge], depth: usize, threshold: f64) -> Vec<u32> {
    let stats = inconsistency(merges, depth);
    let coefficients = stats.iter().map(|s| s.coefficient).collect::<Vec<_>>();
    let max_coefficients = subtree_maximum(merges, &coefficients);
    flat_clusters_monocrit(merges, &max_coefficients, threshold)
}

fn subtree_maximum(merges: &[Merge], values: &[f64]) -> Vec<f64> {
    let n = merges.len() + 1;
    let mut maxima = values.to_vec();

    // Children always precede their parent in a sorted linkage.
    for (i, merge) in merges.iter().enumerate() {
        for child in [merge.left, merge.right] {
            if child >= n {
                maxima[i] = maxima[i].max(maxima[child - n]);
            }
        }
    }

    maxima
}

fn flat_clusters_monocrit(merges: &[Merge], criterion: &[f64], threshold: f64) -> Vec<u32> {
    let n = merges.len() + 1;
    let mut labels = vec![0u32; n];
    if merges.is_empty() {
        labels.fill(1);
        return labels;
    }

    let mut visited = vec![false; 2 * n - 1];
    let mut stack = vec![merges.len() - 1];
    let mut cluster_count = 0u32;
    let mut leader: Option<usize> = None;

    while let Some(&node) = stack.last() {
        let merge = &merges[node];

        if leader.is_none() && criterion[node] <= threshold {
            leader = Some(node);
            cluster_count += 1;
        }

        let pending = [merge.left, merge.right]
            .into_iter()
            .find(|&child| child >= n && !visited[child]);
        if let Some(child) = pending {
            visited[child] = true;
            stack.push(child - n);
            continue;
        }

        for child in [merge.left, merge.right] {
            if child < n {
                if leader.is_none() {
                    cluster_count += 1;
                }
                labels[child] = cluster_count;
            }
        }

        if leader == Some(node) {
            leader = None;
        }
        stack.pop();
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(coords: &[(f32, f32)]) -> Vec<Point> {
        coords.iter().map(|&(x, y)| Point::new(x, y)).collect()
    }

    #[test]
    fn test_condensed_indexing() {
        let pts = points(&[(0.0, 0.0), (3.0, 4.0), (6.0, 8.0)]);
        let d = CondensedMatrix::euclidean(&pts);
        assert_eq!(d.len(), 3);
        assert!((d.get(0, 1) - 5.0).abs() < 1e-9);
        assert!((d.get(2, 0) - 10.0).abs() < 1e-9);
        assert!((d.get(1, 2) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_ward_linkage_on_line() {
        // Ward merge height of singletons equals their distance; merging
        // {0,1} with 2 gives sqrt((2 * 1 + 2 * 4 - 1 * 1) / 3) = sqrt(3).
        let pts = points(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]);
        let merges = ward_linkage(&CondensedMatrix::euclidean(&pts));
        assert_eq!(merges.len(), 2);
        assert_eq!((merges[0].left, merges[0].right), (0, 1));
        assert!((merges[0].height - 1.0).abs() < 1e-9);
        assert_eq!((merges[1].left, merges[1].right), (2, 3));
        assert!((merges[1].height - 3f64.sqrt()).abs() < 1e-9);
        assert_eq!(merges[1].size, 3);
    }

    #[test]
    fn test_ward_linkage_two_groups() {
        let pts = points(&[(0.0, 0.0), (100.0, 0.0), (1.0, 0.0), (101.0, 0.0)]);
        let merges = ward_linkage(&CondensedMatrix::euclidean(&pts));
        assert_eq!((merges[0].left, merges[0].right), (0, 2));
        assert_eq!((merges[1].left, merges[1].right), (1, 3));
        assert_eq!((merges[2].left, merges[2].right), (4, 5));
        assert_eq!(merges[2].size, 4);
        assert!(merges[2].height > 100.0);
    }

    #[test]
    fn test_inconsistency_statistics() {
        let merges = vec![
            Merge { left: 0, right: 1, height: 1.0, size: 2 },
            Merge { left: 2, right: 3, height: 1.0, size: 2 },
            Merge { left: 4, right: 5, height: 4.0, size: 4 },
        ];
        let stats = inconsistency(&merges, 2);
        assert_eq!(stats[0].count, 1);
        assert_eq!(stats[0].coefficient, 0.0);
        assert_eq!(stats[2].count, 3);
        assert!((stats[2].mean - 2.0).abs() < 1e-9);
        assert!((stats[2].std_dev - 3f64.sqrt()).abs() < 1e-9);
        assert!((stats[2].coefficient - 2.0 / 3f64.sqrt()).abs() < 1e-9);

        let shallow = inconsistency(&merges, 1);
        assert_eq!(shallow[2].count, 1);
    }

    #[test]
    fn test_flat_clusters_threshold() {
        let merges = vec![
            Merge { left: 0, right: 1, height: 1.0, size: 2 },
            Merge { left: 2, right: 3, height: 1.0, size: 2 },
            Merge { left: 4, right: 5, height: 4.0, size: 4 },
        ];
        // Root coefficient is 2 / sqrt(3) ~ 1.155.
        let together = flat_clusters_inconsistent(&merges, 2, 2.2);
        assert_eq!(together, vec![1, 1, 1, 1]);

        let split = flat_clusters_inconsistent(&merges, 2, 1.0);
        assert_eq!(split, vec![1, 1, 2, 2]);
    }

    #[test]
    fn test_monocrit_singletons_below_rejected_root() {
        let merges = vec![Merge { left: 0, right: 1, height: 2.0, size: 2 }];
        assert_eq!(flat_clusters_monocrit(&merges, &[5.0], 1.0), vec![1, 2]);
        assert_eq!(flat_clusters_monocrit(&merges, &[0.0], 1.0), vec![1, 1]);
    }
}
