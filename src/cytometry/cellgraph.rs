//! Cell adjacency graph.
//!
//! Cells are nodes; an undirected edge connects two cells whose centroids lie
//! within the configured neighbor distance. The graph is only built when
//! cell-graph features are enabled.

use indexmap::IndexMap;
use petgraph::graph::{NodeIndex, UnGraph};

/// Build the adjacency graph over cell centroids.
///
/// Node weights are cell labels; edge weights are centroid distances.
pub fn build_cell_graph(
    centroids: &IndexMap<u32, (f64, f64)>,
    max_distance: f64,
) -> UnGraph<u32, f64> {
    let mut graph = UnGraph::new_undirected();
    let mut nodes: Vec<(NodeIndex, (f64, f64))> = Vec::with_capacity(centroids.len());
    for (&label, &centroid) in centroids {
        let node = graph.add_node(label);
        nodes.push((node, centroid));
    }
    for (i, &(a, (ax, ay))) in nodes.iter().enumerate() {
        for &(b, (bx, by)) in &nodes[i + 1..] {
            let distance = ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt();
            if distance <= max_distance {
                graph.add_edge(a, b, distance);
            }
        }
    }
    graph
}

/// Per-cell neighbor labels, sorted ascending for deterministic output.
pub fn neighbor_map(graph: &UnGraph<u32, f64>) -> IndexMap<u32, Vec<u32>> {
    let mut map: IndexMap<u32, Vec<u32>> = IndexMap::new();
    for node in graph.node_indices() {
        let label = graph[node];
        let mut neighbors: Vec<u32> = graph.neighbors(node).map(|n| graph[n]).collect();
        neighbors.sort_unstable();
        map.insert(label, neighbors);
    }
    map.sort_keys();
    map
}
