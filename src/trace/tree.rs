//! Execution tree reconstruction.
//!
//! [`reconstruct`] turns the flat event set of one run into a forest ordered by
//! timestamp. Events whose parent is absent become extra roots, and parent cycles are
//! cut, so every input event appears exactly once in the output.

use crate::event::{numeric_field, Event, NumericField};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Problem found while placing or measuring a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceFlag {
    /// Declared parent is not part of the run's event set
    MissingParent { parent_event_id: String },
    /// The link between this node and `linked_event_id` closed a cycle and was cut
    CycleDetected { linked_event_id: String },
    /// Payload field present but not numeric; counted as zero
    MalformedField { field: String, raw: String },
}

/// One event with its children and rollups
///
/// Cloning, comparing and dropping walk the subtree with an explicit stack, so
/// arbitrarily deep parent chains are safe.
#[derive(Debug, Serialize)]
pub struct TreeNode {
    pub event: Event,
    pub children: Vec<TreeNode>,
    pub cost: f64,
    pub duration_ms: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    /// Own cost plus every descendant's
    pub subtree_cost: f64,
    pub subtree_duration_ms: f64,
    pub subtree_tokens_in: u64,
    pub subtree_tokens_out: u64,
    /// 0 for leaves, otherwise 1 + the deepest child
    pub max_depth: usize,
    pub flags: Vec<TraceFlag>,
}

impl TreeNode {
    fn new(event: Event) -> Self {
        let mut flags = Vec::new();

        let mut read = |key: &str| match numeric_field(event.payload(), key) {
            NumericField::Malformed(raw) => {
                flags.push(TraceFlag::MalformedField {
                    field: key.to_string(),
                    raw,
                });
                Some(0.0)
            }
            NumericField::Value(v) => Some(v),
            NumericField::Missing => None,
        };

        let cost = read("cost").unwrap_or(0.0);
        let duration_ms = match read("latency_ms") {
            Some(latency) => latency,
            None => read("duration_ms").unwrap_or(0.0),
        };
        let tokens_in = read("tokens_in").unwrap_or(0.0).max(0.0) as u64;
        let tokens_out = read("tokens_out").unwrap_or(0.0).max(0.0) as u64;

        Self {
            event,
            children: Vec::new(),
            cost,
            duration_ms,
            tokens_in,
            tokens_out,
            subtree_cost: cost,
            subtree_duration_ms: duration_ms,
            subtree_tokens_in: tokens_in,
            subtree_tokens_out: tokens_out,
            max_depth: 0,
            flags,
        }
    }

    fn roll_up(&mut self) {
        self.subtree_cost = self.cost + self.children.iter().map(|c| c.subtree_cost).sum::<f64>();
        self.subtree_duration_ms =
            self.duration_ms + self.children.iter().map(|c| c.subtree_duration_ms).sum::<f64>();
        self.subtree_tokens_in = self.tokens_in + self.children.iter().map(|c| c.subtree_tokens_in).sum::<u64>();
        self.subtree_tokens_out =
            self.tokens_out + self.children.iter().map(|c| c.subtree_tokens_out).sum::<u64>();
        self.max_depth = self
            .children
            .iter()
            .map(|c| c.max_depth + 1)
            .max()
            .unwrap_or(0);
    }

    /// Copy of this node without its children.
    fn detached(&self) -> Self {
        Self {
            event: self.event.clone(),
            children: Vec::with_capacity(self.children.len()),
            cost: self.cost,
            duration_ms: self.duration_ms,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            subtree_cost: self.subtree_cost,
            subtree_duration_ms: self.subtree_duration_ms,
            subtree_tokens_in: self.subtree_tokens_in,
            subtree_tokens_out: self.subtree_tokens_out,
            max_depth: self.max_depth,
            flags: self.flags.clone(),
        }
    }

    /// Equal ignoring children, apart from their number.
    fn same_shape(&self, other: &Self) -> bool {
        self.event == other.event
            && self.cost == other.cost
            && self.duration_ms == other.duration_ms
            && self.tokens_in == other.tokens_in
            && self.tokens_out == other.tokens_out
            && self.subtree_cost == other.subtree_cost
            && self.subtree_duration_ms == other.subtree_duration_ms
            && self.subtree_tokens_in == other.subtree_tokens_in
            && self.subtree_tokens_out == other.subtree_tokens_out
            && self.max_depth == other.max_depth
            && self.flags == other.flags
            && self.children.len() == other.children.len()
    }

    pub fn event_id(&self) -> &str {
        self.event.event_id()
    }

    pub fn is_flagged(&self) -> bool {
        !self.flags.is_empty()
    }

    /// This node and all descendants, depth first.
    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        let mut stack = vec![self];
        std::iter::from_fn(move || {
            let node = stack.pop()?;
            stack.extend(node.children.iter().rev());
            Some(node)
        })
    }
}

impl Clone for TreeNode {
    fn clone(&self) -> Self {
        // (source, next child to copy, copy under construction)
        let mut current = (self, 0, self.detached());
        let mut ancestors = Vec::new();
        loop {
            let source = current.0;
            if let Some(child) = source.children.get(current.1) {
                current.1 += 1;
                let next = (child, 0, child.detached());
                ancestors.push(std::mem::replace(&mut current, next));
                continue;
            }
            match ancestors.pop() {
                Some(mut parent) => {
                    parent.2.children.push(current.2);
                    current = parent;
                }
                None => return current.2,
            }
        }
    }
}

impl PartialEq for TreeNode {
    fn eq(&self, other: &Self) -> bool {
        // preorder plus child counts fixes the shape
        let mut left = self.iter();
        let mut right = other.iter();
        loop {
            match (left.next(), right.next()) {
                (None, None) => return true,
                (Some(a), Some(b)) if a.same_shape(b) => {}
                _ => return false,
            }
        }
    }
}

impl Drop for TreeNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

/// Reconstructed forest of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionTree {
    pub run_id: String,
    pub roots: Vec<TreeNode>,
}

impl ExecutionTree {
    /// Every node, depth first, roots in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = &TreeNode> {
        self.roots.iter().flat_map(|root| root.iter())
    }

    pub fn node_count(&self) -> usize {
        self.iter().count()
    }

    pub fn find(&self, event_id: &str) -> Option<&TreeNode> {
        self.iter().find(|node| node.event_id() == event_id)
    }

    /// `(parent, child)` pairs in traversal order.
    pub fn edges(&self) -> Vec<(&str, &str)> {
        self.iter()
            .flat_map(|node| node.children.iter().map(move |c| (node.event_id(), c.event_id())))
            .collect()
    }

    pub fn flagged(&self) -> impl Iterator<Item = &TreeNode> {
        self.iter().filter(|node| node.is_flagged())
    }

    /// Indented text outline, one node per line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut stack: Vec<(&TreeNode, usize)> = self.roots.iter().rev().map(|root| (root, 0)).collect();

        while let Some((node, depth)) = stack.pop() {
            let label = ["model", "tool_name", "node_name", "step_name"]
                .iter()
                .find_map(|key| node.event.payload().get(*key).and_then(|v| v.as_str()))
                .map(|name| format!(" {}", name))
                .unwrap_or_default();
            out.push_str(&format!(
                "{}{}{} [{}] cost=${:.4} duration={:.1}ms{}\n",
                "  ".repeat(depth),
                node.event.event_type(),
                label,
                node.event_id(),
                node.subtree_cost,
                node.subtree_duration_ms,
                if node.is_flagged() { " (flagged)" } else { "" }
            ));
            stack.extend(node.children.iter().rev().map(|child| (child, depth + 1)));
        }
        out
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Unvisited,
    OnPath,
    Done,
}

struct Builder {
    events: Vec<Event>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    visits: Vec<Visit>,
}

/// Node being built, with the children it has yet to visit
struct Frame {
    index: usize,
    node: TreeNode,
    pending: std::vec::IntoIter<usize>,
}

impl Builder {
    fn open(&mut self, index: usize) -> Frame {
        self.visits[index] = Visit::OnPath;
        Frame {
            index,
            node: TreeNode::new(self.events[index].clone()),
            pending: std::mem::take(&mut self.children[index]).into_iter(),
        }
    }

    /// Build the subtree under `root` depth first with an explicit stack of open nodes.
    fn build(&mut self, root: usize) -> TreeNode {
        let mut current = self.open(root);
        let mut ancestors: Vec<Frame> = Vec::new();

        loop {
            match current.pending.next() {
                Some(child) => match self.visits[child] {
                    Visit::Unvisited => {
                        let next = self.open(child);
                        ancestors.push(std::mem::replace(&mut current, next));
                    }
                    Visit::OnPath => {
                        warn!(
                            "Parent cycle between {} and {}, cutting branch",
                            self.events[current.index].event_id(),
                            self.events[child].event_id()
                        );
                        current.node.flags.push(TraceFlag::CycleDetected {
                            linked_event_id: self.events[child].event_id().to_string(),
                        });
                    }
                    Visit::Done => {}
                },
                None => {
                    self.visits[current.index] = Visit::Done;
                    current.node.roll_up();
                    match ancestors.pop() {
                        Some(mut parent) => {
                            parent.node.children.push(current.node);
                            current = parent;
                        }
                        None => return current.node,
                    }
                }
            }
        }
    }

    /// First event reached by walking up from `index` that lies on a cycle, or the
    /// highest unvisited ancestor.
    fn cycle_entry(&self, index: usize) -> usize {
        let mut seen = HashSet::new();
        let mut current = index;
        while seen.insert(current) {
            match self.parents[current] {
                Some(parent) if self.visits[parent] == Visit::Unvisited => current = parent,
                _ => break,
            }
        }
        current
    }
}

/// Build the execution tree of `run_id` from its events.
///
/// Events are ordered by timestamp; ties keep their input order, so callers pass events
/// in storage order. Duplicate ids keep the first occurrence and events of other runs
/// are ignored.
pub fn reconstruct(run_id: &str, events: Vec<Event>) -> ExecutionTree {
    let mut seen = HashSet::new();
    let mut events: Vec<Event> = events
        .into_iter()
        .filter(|e| {
            if e.run_id() != run_id {
                warn!("Ignoring event {} of run {} while rebuilding {}", e.event_id(), e.run_id(), run_id);
                return false;
            }
            seen.insert(e.event_id().to_string())
        })
        .collect();
    events.sort_by_key(|e| e.timestamp());

    let index: HashMap<&str, usize> = events
        .iter()
        .enumerate()
        .map(|(i, e)| (e.event_id(), i))
        .collect();

    let mut parents = vec![None; events.len()];
    let mut children = vec![Vec::new(); events.len()];
    let mut roots = Vec::new();

    for (i, event) in events.iter().enumerate() {
        match event.parent_event_id() {
            None => roots.push((i, None)),
            Some(parent_id) => match index.get(parent_id) {
                Some(&parent) => {
                    parents[i] = Some(parent);
                    children[parent].push(i);
                }
                None => roots.push((
                    i,
                    Some(TraceFlag::MissingParent {
                        parent_event_id: parent_id.to_string(),
                    }),
                )),
            },
        }
    }

    let mut builder = Builder {
        visits: vec![Visit::Unvisited; events.len()],
        events,
        parents,
        children,
    };

    let mut tree_roots = Vec::with_capacity(roots.len());
    for (i, flag) in roots {
        let mut node = builder.build(i);
        node.flags.extend(flag);
        tree_roots.push(node);
    }

    // whatever is left hangs off a parent cycle
    for i in 0..builder.events.len() {
        if builder.visits[i] != Visit::Unvisited {
            continue;
        }
        let entry = builder.cycle_entry(i);
        let parent_id = builder.events[entry].parent_event_id().unwrap_or_default().to_string();
        let mut node = builder.build(entry);
        node.flags.push(TraceFlag::CycleDetected {
            linked_event_id: parent_id,
        });
        tree_roots.push(node);
    }

    tree_roots.sort_by_key(|node| node.event.timestamp());
    debug!("Rebuilt run {} with {} roots", run_id, tree_roots.len());

    ExecutionTree {
        run_id: run_id.to_string(),
        roots: tree_roots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;

    fn at(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 11, 4, 10, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn event(id: &str, parent: Option<&str>, event_type: EventType, seconds: i64) -> Event {
        Event::new(event_type, "r1", "agent")
            .with_event_id(id)
            .with_parent_opt(parent.map(str::to_string))
            .with_timestamp(at(seconds))
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!((actual - expected).abs() < 1e-9, "{} != {}", actual, expected);
    }

    #[test]
    fn test_root_with_two_llm_calls() {
        let events = vec![
            event("e1", None, EventType::AgentStart, 0),
            event("e2", Some("e1"), EventType::LlmCall, 1).with_field("cost", json!(0.01)),
            event("e3", Some("e1"), EventType::LlmCall, 2).with_field("cost", json!(0.02)),
        ];

        let tree = reconstruct("r1", events);

        assert_eq!(tree.roots.len(), 1);
        let root = &tree.roots[0];
        assert_eq!(root.event_id(), "e1");
        let children: Vec<_> = root.children.iter().map(TreeNode::event_id).collect();
        assert_eq!(children, vec!["e2", "e3"]);
        assert_close(root.subtree_cost, 0.03);
        assert_eq!(root.max_depth, 1);
        assert!(tree.flagged().next().is_none());
    }

    #[test]
    fn test_siblings_follow_timestamps_not_input_order() {
        let events = vec![
            event("e3", Some("e1"), EventType::ToolCall, 5),
            event("e2", Some("e1"), EventType::LlmCall, 3),
            event("e1", None, EventType::AgentStart, 0),
        ];

        let tree = reconstruct("r1", events);
        assert_eq!(tree.edges(), vec![("e1", "e2"), ("e1", "e3")]);
    }

    #[test]
    fn test_equal_timestamps_keep_input_order() {
        let events = vec![
            event("e1", None, EventType::AgentStart, 0),
            event("b", Some("e1"), EventType::Step, 1),
            event("a", Some("e1"), EventType::Step, 1),
        ];

        let tree = reconstruct("r1", events);
        assert_eq!(tree.edges(), vec![("e1", "b"), ("e1", "a")]);
    }

    #[test]
    fn test_orphan_becomes_flagged_root() {
        let events = vec![
            event("e1", None, EventType::AgentStart, 0),
            event("e5", Some("gone"), EventType::LlmCall, 1),
        ];

        let tree = reconstruct("r1", events);

        assert_eq!(tree.roots.len(), 2);
        let orphan = tree.find("e5").unwrap();
        assert_eq!(
            orphan.flags,
            vec![TraceFlag::MissingParent {
                parent_event_id: "gone".to_string()
            }]
        );
    }

    #[test]
    fn test_two_event_cycle_terminates() {
        let events = vec![
            event("a", Some("b"), EventType::Step, 0),
            event("b", Some("a"), EventType::Step, 1),
        ];

        let tree = reconstruct("r1", events);

        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.roots.len(), 1);
        let root = &tree.roots[0];
        assert_eq!(root.event_id(), "a");
        assert_eq!(
            root.flags,
            vec![TraceFlag::CycleDetected {
                linked_event_id: "b".to_string()
            }]
        );
        assert_eq!(
            root.children[0].flags,
            vec![TraceFlag::CycleDetected {
                linked_event_id: "a".to_string()
            }]
        );
    }

    #[test]
    fn test_cycle_root_is_entry_not_descendant() {
        let events = vec![
            event("c", Some("a"), EventType::Step, 0),
            event("a", Some("b"), EventType::Step, 1),
            event("b", Some("a"), EventType::Step, 2),
        ];

        let tree = reconstruct("r1", events);

        assert_eq!(tree.node_count(), 3);
        assert_eq!(tree.roots.len(), 1);
        assert_ne!(tree.roots[0].event_id(), "c");
    }

    #[test]
    fn test_self_parent_is_cut() {
        let events = vec![event("a", Some("a"), EventType::Step, 0)];

        let tree = reconstruct("r1", events);

        assert_eq!(tree.node_count(), 1);
        assert!(tree.roots[0].flags.contains(&TraceFlag::CycleDetected {
            linked_event_id: "a".to_string()
        }));
    }

    #[test]
    fn test_reconstruction_is_deterministic() {
        let events = vec![
            event("e1", None, EventType::AgentStart, 0),
            event("e2", Some("e1"), EventType::LlmCall, 1),
            event("e3", Some("e2"), EventType::ToolCall, 2),
            event("e4", Some("missing"), EventType::Step, 2),
            event("x", Some("y"), EventType::Step, 3),
            event("y", Some("x"), EventType::Step, 4),
        ];

        let first = reconstruct("r1", events.clone());
        let second = reconstruct("r1", events);
        assert_eq!(first, second);
    }

    #[test]
    fn test_rollups_through_deep_chain() {
        let events = vec![
            event("e1", None, EventType::AgentStart, 0),
            event("e2", Some("e1"), EventType::NodeExecution, 1).with_field("duration_ms", json!(100.0)),
            event("e3", Some("e2"), EventType::LlmCall, 2)
                .with_field("cost", json!(0.5))
                .with_field("latency_ms", json!(40))
                .with_field("tokens_in", json!(10))
                .with_field("tokens_out", json!(5)),
            event("e4", Some("e2"), EventType::ToolCall, 3)
                .with_field("latency_ms", json!("12.5")),
        ];

        let tree = reconstruct("r1", events);
        let root = &tree.roots[0];

        assert_eq!(root.max_depth, 2);
        assert_close(root.subtree_cost, 0.5);
        assert_close(root.subtree_duration_ms, 152.5);
        assert_eq!(root.subtree_tokens_in, 10);
        assert_eq!(root.subtree_tokens_out, 5);
        assert_close(tree.find("e2").unwrap().subtree_duration_ms, 152.5);
    }

    #[test]
    fn test_malformed_cost_counts_as_zero() {
        let events = vec![
            event("e1", None, EventType::AgentStart, 0),
            event("e2", Some("e1"), EventType::LlmCall, 1).with_field("cost", json!("lots")),
            event("e3", Some("e1"), EventType::LlmCall, 2).with_field("cost", json!(0.02)),
        ];

        let tree = reconstruct("r1", events);

        assert_close(tree.roots[0].subtree_cost, 0.02);
        let flagged: Vec<_> = tree.flagged().map(TreeNode::event_id).collect();
        assert_eq!(flagged, vec!["e2"]);
        assert!(matches!(
            &tree.find("e2").unwrap().flags[0],
            TraceFlag::MalformedField { field, .. } if field == "cost"
        ));
    }

    #[test]
    fn test_duplicates_and_foreign_events_are_ignored() {
        let events = vec![
            event("e1", None, EventType::AgentStart, 0),
            event("e1", None, EventType::AgentStart, 0),
            Event::new(EventType::Step, "other-run", "agent").with_event_id("z"),
        ];

        let tree = reconstruct("r1", events);
        assert_eq!(tree.node_count(), 1);
    }

    #[test]
    fn test_render_outline() {
        let events = vec![
            event("e1", None, EventType::AgentStart, 0),
            event("e2", Some("e1"), EventType::LlmCall, 1).with_field("model", json!("gpt-4")),
        ];

        let rendered = reconstruct("r1", events).render();
        let lines: Vec<_> = rendered.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("agent_start [e1]"));
        assert!(lines[1].starts_with("  llm_call gpt-4 [e2]"));
    }

    fn chain(len: usize) -> Vec<Event> {
        (0..len)
            .map(|n| {
                let parent = n.checked_sub(1).map(|p| format!("s{}", p));
                event(&format!("s{}", n), parent.as_deref(), EventType::Step, n as i64)
                    .with_field("cost", json!(0.001))
                    .with_field("duration_ms", json!(2.0))
            })
            .collect()
    }

    #[test]
    fn test_ten_thousand_deep_chain() {
        let tree = reconstruct("r1", chain(10_000));

        assert_eq!(tree.roots.len(), 1);
        let root = &tree.roots[0];
        assert_eq!(root.max_depth, 9_999);
        assert_close(root.subtree_duration_ms, 20_000.0);
        assert!((root.subtree_cost - 10.0).abs() < 1e-6);
        assert_eq!(tree.node_count(), 10_000);
        assert_eq!(tree.find("s9999").map(|n| n.max_depth), Some(0));

        let copy = tree.clone();
        assert!(copy == tree);
        drop(copy);
        drop(tree);
    }

    #[test]
    fn test_deep_chain_closed_into_cycle() {
        let mut events = chain(10_000);
        events[0] = events[0].clone().with_parent("s9999");

        let tree = reconstruct("r1", events);

        assert_eq!(tree.node_count(), 10_000);
        assert_eq!(tree.roots.len(), 1);
        assert_eq!(tree.roots[0].event_id(), "s0");
        assert_eq!(tree.flagged().count(), 2);
    }

    #[test]
    fn test_deep_trees_compare_by_structure() {
        let tree = reconstruct("r1", chain(5_000));
        let mut other = reconstruct("r1", chain(5_000));
        assert!(tree == other);

        let mut node = &mut other.roots[0];
        while !node.children.is_empty() {
            node = &mut node.children[0];
        }
        node.cost = 1.0;
        assert!(tree != other);
    }

    #[test]
    fn test_render_deep_chain() {
        let tree = reconstruct("r1", chain(3_000));
        let rendered = tree.render();
        let lines: Vec<_> = rendered.lines().collect();

        assert_eq!(lines.len(), 3_000);
        assert!(lines[0].starts_with("step [s0]"));
        assert!(lines[2_999].starts_with(&format!("{}step [s2999]", "  ".repeat(2_999))));
    }
}
