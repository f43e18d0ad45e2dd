//! Dependency graph of reactive cells and rules.

use slab::Slab;

/// Identifier of a node in a runtime's dependency graph.
///
/// Ordering follows registration order, which is the tiebreak used when two
/// rules have the same rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    serial: u64,
    index: usize,
}

#[derive(Debug)]
pub(crate) struct GraphNode {
    pub(crate) label: String,
    serial: u64,
    /// Longest distance from a node with no inputs. A rule always ranks above
    /// every cell it reads, and a written cell above the rule writing it.
    pub(crate) rank: u32,
    inputs: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

/// Arena of nodes with read edges (cell -> rule) and write edges (rule -> cell).
#[derive(Debug, Default)]
pub(crate) struct Graph {
    nodes: Slab<GraphNode>,
    next_serial: u64,
}

impl Graph {
    pub(crate) fn insert(&mut self, label: impl Into<String>) -> NodeId {
        let serial = self.next_serial;
        self.next_serial += 1;
        let index = self.nodes.insert(GraphNode {
            label: label.into(),
            serial,
            rank: 0,
            inputs: Vec::new(),
            outputs: Vec::new(),
        });
        NodeId { serial, index }
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&GraphNode> {
        self.nodes.get(id.index).filter(|node| node.serial == id.serial)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut GraphNode> {
        self.nodes
            .get_mut(id.index)
            .filter(|node| node.serial == id.serial)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn rank(&self, id: NodeId) -> Option<u32> {
        self.get(id).map(|node| node.rank)
    }

    pub(crate) fn dependents(&self, id: NodeId) -> Vec<NodeId> {
        self.get(id)
            .map(|node| node.outputs.clone())
            .unwrap_or_default()
    }

    /// Wire `rule` to read `reads` and write `writes`.
    ///
    /// Fails with the labels of the offending cycle, without touching the
    /// graph, if any written node can already reach one of the read nodes.
    pub(crate) fn connect(
        &mut self,
        rule: NodeId,
        reads: &[NodeId],
        writes: &[NodeId],
    ) -> Result<(), Vec<String>> {
        for &target in writes {
            for &source in reads {
                if let Some(path) = self.path(target, source) {
                    let mut labels: Vec<String> = path
                        .iter()
                        .filter_map(|id| self.get(*id).map(|n| n.label.clone()))
                        .collect();
                    if let Some(rule) = self.get(rule) {
                        labels.push(rule.label.clone());
                    }
                    if let Some(first) = labels.first().cloned() {
                        labels.push(first);
                    }
                    return Err(labels);
                }
            }
        }

        for &source in reads {
            if !self.contains(source) {
                continue;
            }
            self.link(source, rule);
        }
        for &target in writes {
            if !self.contains(target) {
                continue;
            }
            self.link(rule, target);
        }
        let rank = reads
            .iter()
            .filter_map(|id| self.rank(*id))
            .max()
            .map_or(0, |r| r + 1);
        self.raise_rank(rule, rank);
        Ok(())
    }

    fn link(&mut self, from: NodeId, to: NodeId) {
        if let Some(node) = self.get_mut(from) {
            if !node.outputs.contains(&to) {
                node.outputs.push(to);
            }
        }
        if let Some(node) = self.get_mut(to) {
            if !node.inputs.contains(&from) {
                node.inputs.push(from);
            }
        }
    }

    /// Raise `id` to at least `rank`, pushing every dependent above it.
    fn raise_rank(&mut self, id: NodeId, rank: u32) {
        let mut stack = vec![(id, rank)];
        while let Some((id, rank)) = stack.pop() {
            let Some(node) = self.get_mut(id) else {
                continue;
            };
            node.rank = node.rank.max(rank);
            let next = node.rank + 1;
            let outputs = node.outputs.clone();
            for dependent in outputs {
                if self.rank(dependent).is_some_and(|r| r < next) {
                    stack.push((dependent, next));
                }
            }
        }
    }

    /// Depth-first search along outputs. Returns the nodes from `from` to `to`
    /// inclusive.
    pub(crate) fn path(&self, from: NodeId, to: NodeId) -> Option<Vec<NodeId>> {
        let mut visited = ahash::HashSet::default();
        let mut path = Vec::new();
        if self.path_inner(from, to, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn path_inner(
        &self,
        current: NodeId,
        to: NodeId,
        visited: &mut ahash::HashSet<NodeId>,
        path: &mut Vec<NodeId>,
    ) -> bool {
        if !visited.insert(current) {
            return false;
        }
        path.push(current);
        if current == to {
            return true;
        }
        if let Some(node) = self.get(current) {
            for &next in &node.outputs {
                if self.path_inner(next, to, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Remove a node and every edge touching it.
    pub(crate) fn remove(&mut self, id: NodeId) -> Option<GraphNode> {
        self.get(id)?;
        let node = self.nodes.remove(id.index);
        for &input in &node.inputs {
            if let Some(n) = self.get_mut(input) {
                n.outputs.retain(|o| *o != id);
            }
        }
        for &output in &node.outputs {
            if let Some(n) = self.get_mut(output) {
                n.inputs.retain(|i| *i != id);
            }
        }
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_ranks_above_reads() {
        let mut graph = Graph::default();
        let a = graph.insert("a");
        let b = graph.insert("b");
        let rule = graph.insert("sum");
        let out = graph.insert("out");

        graph.connect(rule, &[a, b], &[out]).unwrap();

        assert_eq!(graph.rank(a), Some(0));
        assert_eq!(graph.rank(rule), Some(1));
        assert_eq!(graph.rank(out), Some(2));
        assert_eq!(graph.dependents(a), vec![rule]);
        assert_eq!(graph.dependents(rule), vec![out]);
    }

    #[test]
    fn test_chain_ranks_propagate() {
        let mut graph = Graph::default();
        let a = graph.insert("a");
        let b = graph.insert("b");
        let to_b = graph.insert("a->b");
        let c = graph.insert("c");
        let to_c = graph.insert("b->c");

        // Register the downstream rule first, then the upstream one.
        graph.connect(to_c, &[b], &[c]).unwrap();
        graph.connect(to_b, &[a], &[b]).unwrap();

        assert!(graph.rank(to_c) > graph.rank(b));
        assert!(graph.rank(b) > graph.rank(to_b));
        assert!(graph.rank(c) > graph.rank(to_c));
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = Graph::default();
        let a = graph.insert("a");
        let b = graph.insert("b");
        let a_to_b = graph.insert("a_to_b");
        let b_to_a = graph.insert("b_to_a");

        graph.connect(a_to_b, &[a], &[b]).unwrap();
        let err = graph.connect(b_to_a, &[b], &[a]).unwrap_err();

        assert_eq!(err, vec!["a", "a_to_b", "b", "b_to_a", "a"]);
        // Rejected rule leaves the graph untouched.
        assert!(graph.dependents(b).is_empty());
    }

    #[test]
    fn test_self_write_is_a_cycle() {
        let mut graph = Graph::default();
        let a = graph.insert("a");
        let rule = graph.insert("rule");

        let err = graph.connect(rule, &[a], &[a]).unwrap_err();
        assert_eq!(err, vec!["a", "rule", "a"]);
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let mut graph = Graph::default();
        let a = graph.insert("a");
        let b = graph.insert("b");
        let c = graph.insert("c");
        let d = graph.insert("d");
        let ab = graph.insert("ab");
        let ac = graph.insert("ac");
        let bcd = graph.insert("bcd");

        graph.connect(ab, &[a], &[b]).unwrap();
        graph.connect(ac, &[a], &[c]).unwrap();
        graph.connect(bcd, &[b, c], &[d]).unwrap();

        assert!(graph.rank(d) > graph.rank(bcd));
    }

    #[test]
    fn test_removal_detaches_edges() {
        let mut graph = Graph::default();
        let a = graph.insert("a");
        let rule = graph.insert("rule");
        graph.connect(rule, &[a], &[]).unwrap();

        let removed = graph.remove(rule).unwrap();
        assert_eq!(removed.label, "rule");
        assert!(graph.dependents(a).is_empty());
        assert!(!graph.contains(rule));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_connect_skips_removed_nodes() {
        let mut graph = Graph::default();
        let a = graph.insert("a");
        let gone = graph.insert("gone");
        let out = graph.insert("out");
        let rule = graph.insert("rule");
        graph.remove(gone);

        graph.connect(rule, &[a, gone], &[out]).unwrap();
        assert_eq!(graph.dependents(a), vec![rule]);
        assert!(graph.rank(out) > graph.rank(rule));
        assert_eq!(graph.len(), 3);
    }

    #[test]
    fn test_stale_id_after_slot_reuse() {
        let mut graph = Graph::default();
        let a = graph.insert("a");
        graph.remove(a);
        let b = graph.insert("b");

        assert!(!graph.contains(a));
        assert!(graph.contains(b));
        assert!(a < b);
    }
}
