//! Execution history and aggregate workflow metrics.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use hubflow_core::WorkflowId;

use crate::model::WorkflowStatus;
use crate::scheduler::ExecutionReport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub workflow_id: WorkflowId,
    pub workflow_name: String,
    pub status: WorkflowStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub success_rate: f64,
}

impl From<&ExecutionReport> for ExecutionRecord {
    fn from(report: &ExecutionReport) -> Self {
        Self {
            workflow_id: report.workflow_id,
            workflow_name: report.workflow_name.clone(),
            status: report.status,
            started_at: report.started_at,
            elapsed_ms: report.elapsed_ms,
            success_rate: report.success_rate,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameStats {
    pub executions: usize,
    pub completed: usize,
    pub average_execution_ms: f64,
    pub average_success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    pub executions: usize,
    /// Share of executions in the window that ended `Completed`.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowAnalytics {
    pub total_executions: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub average_execution_ms: f64,
    pub average_success_rate: f64,
    pub last_24h: WindowStats,
    pub by_name: BTreeMap<String, NameStats>,
}

/// Bounded execution history; oldest records fall off first.
#[derive(Debug, Clone)]
pub struct AnalyticsStore {
    records: VecDeque<ExecutionRecord>,
    capacity: usize,
}

impl Default for AnalyticsStore {
    fn default() -> Self {
        Self::with_capacity(10_000)
    }
}

impl AnalyticsStore {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&mut self, record: ExecutionRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn summarize(&self, now: DateTime<Utc>) -> WorkflowAnalytics {
        let mut out = WorkflowAnalytics {
            total_executions: self.records.len(),
            ..Default::default()
        };
        if self.records.is_empty() {
            return out;
        }

        let window_start = now - ChronoDuration::hours(24);
        let mut window_completed = 0usize;
        let mut total_ms = 0f64;
        let mut total_rate = 0f64;
        let mut per_name: BTreeMap<String, (usize, usize, f64, f64)> = BTreeMap::new();

        for r in &self.records {
            let done = r.status == WorkflowStatus::Completed;
            match r.status {
                WorkflowStatus::Completed => out.completed += 1,
                WorkflowStatus::Failed => out.failed += 1,
                WorkflowStatus::Cancelled => out.cancelled += 1,
                WorkflowStatus::Pending | WorkflowStatus::Executing => {}
            }
            total_ms += r.elapsed_ms as f64;
            total_rate += r.success_rate;

            if r.started_at >= window_start {
                out.last_24h.executions += 1;
                window_completed += usize::from(done);
            }

            let entry = per_name.entry(r.workflow_name.clone()).or_default();
            entry.0 += 1;
            entry.1 += usize::from(done);
            entry.2 += r.elapsed_ms as f64;
            entry.3 += r.success_rate;
        }

        let n = self.records.len() as f64;
        out.average_execution_ms = total_ms / n;
        out.average_success_rate = total_rate / n;
        if out.last_24h.executions > 0 {
            out.last_24h.success_rate = window_completed as f64 / out.last_24h.executions as f64;
        }
        out.by_name = per_name
            .into_iter()
            .map(|(name, (count, completed, ms, rate))| {
                let stats = NameStats {
                    executions: count,
                    completed,
                    average_execution_ms: ms / count as f64,
                    average_success_rate: rate / count as f64,
                };
                (name, stats)
            })
            .collect();
        out
    }
}
