use super::tree::ExecutionTree;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Aggregate totals of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSummary {
    pub run_id: String,
    pub total_cost: f64,
    /// Sum of the roots' subtree durations
    pub total_duration_ms: f64,
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub event_counts: BTreeMap<String, usize>,
    pub event_count: usize,
    pub root_count: usize,
    pub max_depth: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Time between the first and last event
    pub wall_clock_ms: f64,
    pub flagged_nodes: usize,
}

impl TraceSummary {
    pub fn from_tree(tree: &ExecutionTree) -> Self {
        let mut event_counts = BTreeMap::new();
        let mut started_at: Option<DateTime<Utc>> = None;
        let mut ended_at: Option<DateTime<Utc>> = None;
        let mut event_count = 0;
        let mut flagged_nodes = 0;

        for node in tree.iter() {
            event_count += 1;
            if node.is_flagged() {
                flagged_nodes += 1;
            }
            *event_counts.entry(node.event.event_type().to_string()).or_insert(0) += 1;

            let ts = node.event.timestamp();
            started_at = Some(started_at.map_or(ts, |s| s.min(ts)));
            ended_at = Some(ended_at.map_or(ts, |e| e.max(ts)));
        }

        let wall_clock_ms = match (started_at, ended_at) {
            (Some(start), Some(end)) => (end - start).num_microseconds().unwrap_or(0) as f64 / 1000.0,
            _ => 0.0,
        };

        Self {
            run_id: tree.run_id.clone(),
            total_cost: tree.roots.iter().map(|r| r.subtree_cost).sum(),
            total_duration_ms: tree.roots.iter().map(|r| r.subtree_duration_ms).sum(),
            total_tokens_in: tree.roots.iter().map(|r| r.subtree_tokens_in).sum(),
            total_tokens_out: tree.roots.iter().map(|r| r.subtree_tokens_out).sum(),
            event_counts,
            event_count,
            root_count: tree.roots.len(),
            max_depth: tree.roots.iter().map(|r| r.max_depth).max().unwrap_or(0),
            started_at,
            ended_at,
            wall_clock_ms,
            flagged_nodes,
        }
    }
}
