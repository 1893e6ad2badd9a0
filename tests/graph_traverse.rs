//! Graph-store integration: adjacency cursors and bounded BFS traversal
//! over concept/relation tables built through the public write path.

use sharc::graph::{
    ConceptStore, ConceptTableAdapter, Direction, GraphTraversal, RelationStore,
    RelationTableAdapter, TraverseOptions,
};
use sharc::{Database, Value};

/// Diamond-plus-tail graph: 1->2, 1->3, 2->4, 3->4, 4->5.
fn diamond_db() -> Database {
    build_db(&[(1, 2), (1, 3), (2, 4), (3, 4), (4, 5)], 5)
}

fn build_db(edges: &[(i64, i64)], nodes: i64) -> Database {
    let mut db = Database::create_memory().unwrap();
    let mut txn = db.begin_transaction().unwrap();
    txn.create_table("concepts", "key INTEGER, id TEXT, type INTEGER, data TEXT")
        .unwrap();
    for key in 1..=nodes {
        txn.insert(
            "concepts",
            None,
            &[
                Value::Integer(key),
                format!("node-{}", key).into(),
                Value::Integer(1),
                format!("{{\"k\":{}}}", key).into(),
            ],
        )
        .unwrap();
    }
    txn.create_table(
        "relations",
        "id INTEGER PRIMARY KEY, origin_key INTEGER, target_key INTEGER, kind INTEGER, data TEXT, weight REAL",
    )
    .unwrap();
    for &(origin, target) in edges {
        txn.insert(
            "relations",
            None,
            &[
                Value::Null,
                Value::Integer(origin),
                Value::Integer(target),
                Value::Integer(1),
                "".into(),
                Value::Real(1.0),
            ],
        )
        .unwrap();
    }
    txn.commit().unwrap();
    db
}

fn stores(db: &Database) -> (ConceptStore<'_>, RelationStore<'_>) {
    (
        ConceptStore::initialize(db, &ConceptTableAdapter::default()).unwrap(),
        RelationStore::initialize(db, &RelationTableAdapter::default()).unwrap(),
    )
}

#[test]
fn test_bfs_depth_two_matches_expected_order() {
    let db = diamond_db();
    let (concepts, relations) = stores(&db);
    let result = GraphTraversal::new(&concepts, &relations)
        .traverse(
            1,
            &TraverseOptions {
                max_depth: 2,
                direction: Direction::Outgoing,
                ..TraverseOptions::default()
            },
        )
        .unwrap();

    let visited: Vec<(i64, u32)> = result.nodes.iter().map(|n| (n.key, n.depth)).collect();
    assert_eq!(visited, vec![(1, 0), (2, 1), (3, 1), (4, 2)]);
    // Depth-2 cutoff keeps node 5 out.
    assert!(result.nodes.iter().all(|n| n.key != 5));
}

#[test]
fn test_bfs_phase_two_fetches_concepts() {
    let db = diamond_db();
    let (concepts, relations) = stores(&db);
    let result = GraphTraversal::new(&concepts, &relations)
        .traverse(1, &TraverseOptions::default())
        .unwrap();

    for node in &result.nodes {
        let concept = node.concept.as_ref().expect("every key has a concept row");
        assert_eq!(concept.key, node.key);
        assert_eq!(concept.id, format!("node-{}", node.key));
    }
}

#[test]
fn test_bfs_visit_bound_under_fanout_cap() {
    // A star: node 1 points at 2..=20.
    let edges: Vec<(i64, i64)> = (2..=20).map(|t| (1, t)).collect();
    let db = build_db(&edges, 20);
    let (concepts, relations) = stores(&db);

    let max_fanout = 5;
    let result = GraphTraversal::new(&concepts, &relations)
        .traverse(
            1,
            &TraverseOptions {
                max_depth: 1,
                max_fanout,
                ..TraverseOptions::default()
            },
        )
        .unwrap();

    // visited <= 1 + min(max_fanout, actual fanout).
    assert_eq!(result.nodes.len(), 1 + max_fanout);
    let mut seen = std::collections::HashSet::new();
    assert!(result.nodes.iter().all(|n| seen.insert(n.key)));
}

#[test]
fn test_bfs_both_directions() {
    let db = diamond_db();
    let (concepts, relations) = stores(&db);
    let result = GraphTraversal::new(&concepts, &relations)
        .traverse(
            4,
            &TraverseOptions {
                max_depth: 1,
                direction: Direction::Both,
                ..TraverseOptions::default()
            },
        )
        .unwrap();

    let mut keys: Vec<i64> = result.nodes.iter().map(|n| n.key).collect();
    keys.sort_unstable();
    // Out: 5. In: 2 and 3. Plus the start node.
    assert_eq!(keys, vec![2, 3, 4, 5]);
}

#[test]
fn test_bfs_paths_reconstructed() {
    let db = diamond_db();
    let (concepts, relations) = stores(&db);
    let result = GraphTraversal::new(&concepts, &relations)
        .traverse(
            1,
            &TraverseOptions {
                max_depth: 3,
                record_paths: true,
                ..TraverseOptions::default()
            },
        )
        .unwrap();

    let five = result.nodes.iter().find(|n| n.key == 5).expect("node 5 reached");
    let path = five.path.as_ref().unwrap();
    assert_eq!(path.first(), Some(&1));
    assert_eq!(path.last(), Some(&5));
    assert_eq!(path.len(), 4, "1 -> first parent -> 4 -> 5");
}

#[test]
fn test_edge_cursor_reset_multi_hop() {
    let db = diamond_db();
    let (_, relations) = stores(&db);
    let mut cursor = relations.outgoing(1, None).unwrap();
    let mut hops = Vec::new();
    while cursor.move_next().unwrap() {
        hops.push(cursor.target().unwrap());
    }
    cursor.reset(*hops.first().unwrap(), None);
    while cursor.move_next().unwrap() {
        hops.push(cursor.target().unwrap());
    }
    assert_eq!(hops, vec![2, 3, 4]);
}

#[test]
fn test_concept_lookup_by_key_and_id() {
    let db = diamond_db();
    let (concepts, _) = stores(&db);
    assert_eq!(concepts.get_by_key(3).unwrap().unwrap().id, "node-3");
    assert_eq!(concepts.get_by_id("node-4").unwrap().unwrap().key, 4);
    assert!(concepts.get_by_key(99).unwrap().is_none());
}
