//! Two-phase BFS traversal over the graph stores.
//!
//! Phase 1 walks edges only: a classic BFS queue with a visited set,
//! per-node depth, optional parent map for path reconstruction, and the
//! policy limits (depth, fan-out, kind, minimum weight, token budget,
//! wall-clock timeout, stop-at target). Phase 2 batch-fetches the full
//! node records, one store lookup per visited key, so edge pages and node
//! pages each stay hot in the cache during their own phase.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::debug;

use crate::error::Result;

use super::concept::{Concept, ConceptStore};
use super::relation::{EdgeCursor, EdgeEndpoint, RelationStore};

/// Edge directions followed from each node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    /// Follow origin -> target
    #[default]
    Outgoing,
    /// Follow target -> origin
    Incoming,
    /// Follow both
    Both,
}

/// Traversal policy limits.
#[derive(Debug, Clone)]
pub struct TraverseOptions {
    /// Maximum depth from the start node
    pub max_depth: u32,
    /// Maximum edges expanded per node
    pub max_fanout: usize,
    /// Directions to follow
    pub direction: Direction,
    /// Only edges of this kind, when set
    pub kind: Option<i64>,
    /// Only edges at or above this weight, when set
    pub min_weight: Option<f64>,
    /// Stop once this many tokens of edge data were visited
    pub max_tokens: Option<i64>,
    /// Wall-clock budget, checked between edge iterations
    pub timeout: Option<Duration>,
    /// Short-circuit when this node key is discovered
    pub stop_at: Option<i64>,
    /// Record parent links and reconstruct paths
    pub record_paths: bool,
}

impl Default for TraverseOptions {
    fn default() -> Self {
        TraverseOptions {
            max_depth: 2,
            max_fanout: 32,
            direction: Direction::default(),
            kind: None,
            min_weight: None,
            max_tokens: None,
            timeout: None,
            stop_at: None,
            record_paths: false,
        }
    }
}

/// One visited node in discovery order.
#[derive(Debug, Clone)]
pub struct TraversalNode {
    /// Node key
    pub key: i64,
    /// Depth at which the node was discovered
    pub depth: u32,
    /// Full node record; None when the key has no concept row
    pub concept: Option<Concept>,
    /// Start-to-node key path, when requested
    pub path: Option<Vec<i64>>,
}

/// Why the traversal stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Frontier exhausted within the depth limit
    Exhausted,
    /// The stop-at target was discovered
    TargetFound,
    /// The token budget ran out
    TokenBudget,
    /// The wall-clock budget ran out
    Timeout,
}

/// Traversal output.
#[derive(Debug)]
pub struct TraversalResult {
    /// Visited nodes ordered by depth, then discovery order
    pub nodes: Vec<TraversalNode>,
    /// Why the walk ended
    pub stop_reason: StopReason,
    /// Tokens accumulated from visited edge data
    pub tokens_visited: i64,
}

/// BFS driver bound to a concept and a relation store.
pub struct GraphTraversal<'db, 's> {
    concepts: &'s ConceptStore<'db>,
    relations: &'s RelationStore<'db>,
}

impl<'db, 's> GraphTraversal<'db, 's> {
    /// Driver over the two stores.
    pub fn new(concepts: &'s ConceptStore<'db>, relations: &'s RelationStore<'db>) -> Self {
        GraphTraversal {
            concepts,
            relations,
        }
    }

    /// Run a bounded BFS from `start_key`.
    pub fn traverse(&self, start_key: i64, options: &TraverseOptions) -> Result<TraversalResult> {
        let started = Instant::now();

        // Phase 1: edges only.
        let mut visited: HashSet<i64> = HashSet::new();
        let mut order: Vec<(i64, u32)> = Vec::new();
        let mut parents: HashMap<i64, i64> = HashMap::new();
        let mut queue: VecDeque<(i64, u32)> = VecDeque::new();
        let mut tokens: i64 = 0;
        let mut stop_reason = StopReason::Exhausted;

        visited.insert(start_key);
        order.push((start_key, 0));
        queue.push_back((start_key, 0));

        // One reusable cursor per direction for the whole walk.
        let mut out_cursor: Option<EdgeCursor<'db>> = None;
        let mut in_cursor: Option<EdgeCursor<'db>> = None;

        'walk: while let Some((node, depth)) = queue.pop_front() {
            if depth >= options.max_depth {
                continue;
            }
            let mut fanout = 0usize;

            let endpoints: &[EdgeEndpoint] = match options.direction {
                Direction::Outgoing => &[EdgeEndpoint::Origin],
                Direction::Incoming => &[EdgeEndpoint::Target],
                Direction::Both => &[EdgeEndpoint::Origin, EdgeEndpoint::Target],
            };

            for &endpoint in endpoints {
                let cursor = match endpoint {
                    EdgeEndpoint::Origin => &mut out_cursor,
                    EdgeEndpoint::Target => &mut in_cursor,
                };
                match cursor {
                    Some(c) => c.reset(node, options.kind),
                    None => {
                        *cursor =
                            Some(self.relations.edges(endpoint, node, options.kind)?)
                    }
                }
                let cursor = cursor.as_mut().expect("cursor just installed");

                while cursor.move_next()? {
                    if let Some(budget) = options.timeout {
                        if started.elapsed() > budget {
                            debug!("traversal timed out after {:?}", started.elapsed());
                            stop_reason = StopReason::Timeout;
                            break 'walk;
                        }
                    }
                    if fanout >= options.max_fanout {
                        break;
                    }

                    if let Some(min) = options.min_weight {
                        match cursor.weight()? {
                            Some(w) if w >= min => {}
                            _ => continue,
                        }
                    }
                    fanout += 1;
                    tokens += cursor.token_cost()?;

                    let neighbor = match endpoint {
                        EdgeEndpoint::Origin => cursor.target()?,
                        EdgeEndpoint::Target => cursor.origin()?,
                    };
                    if !visited.insert(neighbor) {
                        continue;
                    }
                    if options.record_paths {
                        parents.insert(neighbor, node);
                    }
                    order.push((neighbor, depth + 1));
                    queue.push_back((neighbor, depth + 1));

                    if options.stop_at == Some(neighbor) {
                        stop_reason = StopReason::TargetFound;
                        break 'walk;
                    }
                    if let Some(budget) = options.max_tokens {
                        if tokens >= budget {
                            debug!("traversal hit its token budget ({})", tokens);
                            stop_reason = StopReason::TokenBudget;
                            break 'walk;
                        }
                    }
                }
            }
        }

        // Phase 2: batch node lookups in discovery order.
        let mut nodes = Vec::with_capacity(order.len());
        for (key, depth) in order {
            let path = options.record_paths.then(|| {
                let mut chain = vec![key];
                let mut at = key;
                while let Some(&parent) = parents.get(&at) {
                    chain.push(parent);
                    at = parent;
                }
                chain.reverse();
                chain
            });
            nodes.push(TraversalNode {
                key,
                depth,
                concept: self.concepts.get_by_key(key)?,
                path,
            });
        }

        Ok(TraversalResult {
            nodes,
            stop_reason,
            tokens_visited: tokens,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::test_support::sample_graph_db;
    use crate::graph::{ConceptTableAdapter, RelationTableAdapter};
    use crate::database::Database;

    fn stores(db: &Database) -> (ConceptStore<'_>, RelationStore<'_>) {
        (
            ConceptStore::initialize(db, &ConceptTableAdapter::default()).unwrap(),
            RelationStore::initialize(db, &RelationTableAdapter::default()).unwrap(),
        )
    }

    fn keys(result: &TraversalResult) -> Vec<(i64, u32)> {
        result.nodes.iter().map(|n| (n.key, n.depth)).collect()
    }

    #[test]
    fn test_bfs_depth_two_outgoing() {
        // Edges: 1->2, 1->3, 2->4, 3->4, 4->5.
        let db = sample_graph_db(false);
        let (concepts, relations) = stores(&db);
        let result = GraphTraversal::new(&concepts, &relations)
            .traverse(1, &TraverseOptions::default())
            .unwrap();

        assert_eq!(keys(&result), vec![(1, 0), (2, 1), (3, 1), (4, 2)]);
        assert_eq!(result.stop_reason, StopReason::Exhausted);
        // Every visited key resolves to a concept.
        assert!(result.nodes.iter().all(|n| n.concept.is_some()));
    }

    #[test]
    fn test_bfs_no_node_twice() {
        let db = sample_graph_db(false);
        let (concepts, relations) = stores(&db);
        let result = GraphTraversal::new(&concepts, &relations)
            .traverse(
                1,
                &TraverseOptions {
                    max_depth: 10,
                    ..TraverseOptions::default()
                },
            )
            .unwrap();
        let mut seen = std::collections::HashSet::new();
        for node in &result.nodes {
            assert!(seen.insert(node.key), "node {} visited twice", node.key);
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_bfs_fanout_limit() {
        let db = sample_graph_db(false);
        let (concepts, relations) = stores(&db);
        let result = GraphTraversal::new(&concepts, &relations)
            .traverse(
                1,
                &TraverseOptions {
                    max_fanout: 1,
                    ..TraverseOptions::default()
                },
            )
            .unwrap();
        // Node 1 expands only its first edge (to 2), node 2 only to 4.
        assert_eq!(keys(&result), vec![(1, 0), (2, 1), (4, 2)]);
    }

    #[test]
    fn test_bfs_incoming() {
        let db = sample_graph_db(false);
        let (concepts, relations) = stores(&db);
        let result = GraphTraversal::new(&concepts, &relations)
            .traverse(
                4,
                &TraverseOptions {
                    direction: Direction::Incoming,
                    max_depth: 1,
                    ..TraverseOptions::default()
                },
            )
            .unwrap();
        assert_eq!(keys(&result), vec![(4, 0), (2, 1), (3, 1)]);
    }

    #[test]
    fn test_bfs_stop_at_target() {
        let db = sample_graph_db(false);
        let (concepts, relations) = stores(&db);
        let result = GraphTraversal::new(&concepts, &relations)
            .traverse(
                1,
                &TraverseOptions {
                    max_depth: 10,
                    stop_at: Some(4),
                    record_paths: true,
                    ..TraverseOptions::default()
                },
            )
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::TargetFound);
        let last = result.nodes.last().unwrap();
        assert_eq!(last.key, 4);
        assert_eq!(last.path.as_deref(), Some(&[1, 2, 4][..]));
    }

    #[test]
    fn test_bfs_kind_filter() {
        let db = sample_graph_db(false);
        let (concepts, relations) = stores(&db);
        // Only kind-10 edges: 1->2 and 2->4.
        let result = GraphTraversal::new(&concepts, &relations)
            .traverse(
                1,
                &TraverseOptions {
                    kind: Some(10),
                    ..TraverseOptions::default()
                },
            )
            .unwrap();
        assert_eq!(keys(&result), vec![(1, 0), (2, 1), (4, 2)]);
    }

    #[test]
    fn test_bfs_min_weight() {
        let db = sample_graph_db(false);
        let (concepts, relations) = stores(&db);
        // Weights are 0.1 * (origin + target); 1->2 is 0.3, 1->3 is 0.4.
        let result = GraphTraversal::new(&concepts, &relations)
            .traverse(
                1,
                &TraverseOptions {
                    max_depth: 1,
                    min_weight: Some(0.35),
                    ..TraverseOptions::default()
                },
            )
            .unwrap();
        assert_eq!(keys(&result), vec![(1, 0), (3, 1)]);
    }

    #[test]
    fn test_bfs_token_budget_stops() {
        let db = sample_graph_db(false);
        let (concepts, relations) = stores(&db);
        let result = GraphTraversal::new(&concepts, &relations)
            .traverse(
                1,
                &TraverseOptions {
                    max_depth: 10,
                    max_tokens: Some(1),
                    ..TraverseOptions::default()
                },
            )
            .unwrap();
        assert_eq!(result.stop_reason, StopReason::TokenBudget);
        assert!(result.nodes.len() < 5);
    }

    #[test]
    fn test_bfs_works_with_indexes() {
        let db = sample_graph_db(true);
        let (concepts, relations) = stores(&db);
        let result = GraphTraversal::new(&concepts, &relations)
            .traverse(1, &TraverseOptions::default())
            .unwrap();
        let mut found: Vec<i64> = result.nodes.iter().map(|n| n.key).collect();
        found.sort_unstable();
        assert_eq!(found, vec![1, 2, 3, 4]);
    }
}
