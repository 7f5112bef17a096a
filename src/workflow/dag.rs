//! DAG resolver: pure functions over a workflow's edge list.
//!
//! No state, no I/O. Handles diamond graphs (multiple parents) and start
//! nodes (zero parents, dispatched at workflow-run creation, never by
//! fan-out).

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// All nodes with an edge into `node`.
pub fn parents(mapping: &[(String, String)], node: &str) -> Vec<String> {
    mapping
        .iter()
        .filter(|(_, child)| child == node)
        .map(|(parent, _)| parent.clone())
        .collect()
}

/// All nodes with an edge out of `node`.
pub fn children(mapping: &[(String, String)], node: &str) -> Vec<String> {
    mapping
        .iter()
        .filter(|(parent, _)| parent == node)
        .map(|(_, child)| child.clone())
        .collect()
}

/// Nodes with no incoming edge.
pub fn start_nodes(mapping: &[(String, String)], nodes: &[String]) -> Vec<String> {
    let with_parents: HashSet<&String> = mapping.iter().map(|(_, child)| child).collect();
    nodes
        .iter()
        .filter(|n| !with_parents.contains(n))
        .cloned()
        .collect()
}

/// Nodes with no outgoing edge.
pub fn end_nodes(mapping: &[(String, String)], nodes: &[String]) -> Vec<String> {
    let with_children: HashSet<&String> = mapping.iter().map(|(parent, _)| parent).collect();
    nodes
        .iter()
        .filter(|n| !with_children.contains(n))
        .cloned()
        .collect()
}

/// Reject cyclic mappings with a DFS. The fan-out algorithm assumes a DAG
/// and would re-arm forever on a cycle, so this runs at definition save
/// time rather than execution time.
pub fn validate_acyclic(mapping: &[(String, String)], nodes: &[String]) -> Result<()> {
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    for (parent, child) in mapping {
        graph.entry(parent.as_str()).or_default().push(child.as_str());
    }

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    for node in nodes {
        if !visited.contains(node.as_str())
            && has_cycle(node.as_str(), &graph, &mut visited, &mut rec_stack)
        {
            return Err(Error::Workflow(format!(
                "Circular dependency detected involving node '{}'",
                node
            )));
        }
    }

    Ok(())
}

fn has_cycle<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
) -> bool {
    visited.insert(node);
    rec_stack.insert(node);

    if let Some(neighbors) = graph.get(node) {
        for neighbor in neighbors {
            if !visited.contains(neighbor) {
                if has_cycle(neighbor, graph, visited, rec_stack) {
                    return true;
                }
            } else if rec_stack.contains(neighbor) {
                return true;
            }
        }
    }

    rec_stack.remove(node);
    false
}
