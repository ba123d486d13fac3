//! Bounded retention of job results keyed by job id.

use std::collections::{HashMap, VecDeque};

use super::JobResult;

/// Keeps the most recently inserted results, evicting the oldest first.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    entries: HashMap<String, JobResult>,
    order: VecDeque<String>,
}

impl ResultCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn get(&self, job_id: &str) -> Option<&JobResult> {
        self.entries.get(job_id)
    }

    /// Store `result`, returning the previous entry for the same job.
    pub fn insert(&mut self, result: JobResult) -> Option<JobResult> {
        let job_id = result.job_id.clone();
        let previous = self.entries.insert(job_id.clone(), result);
        if previous.is_none() {
            self.order.push_back(job_id);
            while self.order.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.entries.remove(&oldest);
                }
            }
        }
        previous
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
