//! Deterministic rank to task assignment

use lockstep_common::error::{LockstepError, Result};
use serde::Serialize;

/// One rank's share of the task list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadAssignment<T> {
    pub rank: usize,
    pub task_index: usize,
    pub task: T,
}

/// Maps rank `r` to `tasks[r % len]`
///
/// Pure function of the rank and the ordered task list, so every run with the
/// same inputs assigns the same work.
#[derive(Debug, Clone)]
pub struct WorkloadPartitioner<T> {
    tasks: Vec<T>,
}

impl<T: Clone> WorkloadPartitioner<T> {
    pub fn new(tasks: Vec<T>) -> Result<Self> {
        if tasks.is_empty() {
            return Err(LockstepError::config("task list must not be empty"));
        }
        Ok(Self { tasks })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn index_for(&self, rank: usize) -> usize {
        rank % self.tasks.len()
    }

    pub fn assign(&self, rank: usize) -> WorkloadAssignment<T> {
        let task_index = self.index_for(rank);
        WorkloadAssignment {
            rank,
            task_index,
            task: self.tasks[task_index].clone(),
        }
    }

    /// The full plan for a group of `size`
    pub fn plan(&self, size: usize) -> Vec<WorkloadAssignment<T>> {
        (0..size).map(|rank| self.assign(rank)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompts(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("prompt {}", i)).collect()
    }

    #[test]
    fn test_three_prompts_five_ranks() {
        let partitioner = WorkloadPartitioner::new(prompts(3)).unwrap();
        let indices: Vec<usize> = partitioner.plan(5).iter().map(|a| a.task_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_assignment_is_deterministic() {
        let partitioner = WorkloadPartitioner::new(prompts(4)).unwrap();
        for rank in 0..20 {
            let first = partitioner.assign(rank);
            assert_eq!(first, partitioner.assign(rank));
            assert_eq!(first.task_index, rank % 4);
            assert_eq!(first.task, format!("prompt {}", rank % 4));
        }
    }

    #[test]
    fn test_single_task_goes_to_everyone() {
        let partitioner = WorkloadPartitioner::new(prompts(1)).unwrap();
        assert!(partitioner.plan(6).iter().all(|a| a.task_index == 0));
    }

    #[test]
    fn test_more_tasks_than_ranks_do_not_recur() {
        let partitioner = WorkloadPartitioner::new(prompts(10)).unwrap();
        let plan = partitioner.plan(4);
        let mut indices: Vec<usize> = plan.iter().map(|a| a.task_index).collect();
        indices.dedup();
        assert_eq!(indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_empty_task_list() {
        let err = WorkloadPartitioner::<String>::new(Vec::new()).unwrap_err();
        assert!(matches!(err, LockstepError::Config(_)));
    }
}
