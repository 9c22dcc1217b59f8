//! Task Queue - priority task queue

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use tracing::debug;

use super::task::{Task, TaskPriority};

/// Wraps a Task for heap ordering
#[derive(Debug)]
struct PrioritizedTask {
    task: Task,
    sequence: u64, // FIFO among equal priority and creation time
}

impl PartialEq for PrioritizedTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PrioritizedTask {}

impl PartialOrd for PrioritizedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then earlier creation
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.task.created_at.cmp(&self.task.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Unbounded priority queue of pending tasks
#[derive(Debug, Default)]
pub struct TaskQueue {
    heap: BinaryHeap<PrioritizedTask>,
    sequence_counter: u64,
    enqueued_count: u64,
    dequeued_count: u64,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        let sequence = self.sequence_counter;
        self.sequence_counter += 1;
        debug!(
            "Enqueuing task {} ({}, priority {})",
            task.task_id, task.task_type, task.priority
        );
        self.heap.push(PrioritizedTask { task, sequence });
        self.enqueued_count += 1;
    }

    /// Put a popped task back without counting it as a new submission
    pub fn requeue(&mut self, task: Task) {
        let sequence = self.sequence_counter;
        self.sequence_counter += 1;
        self.heap.push(PrioritizedTask { task, sequence });
        self.dequeued_count = self.dequeued_count.saturating_sub(1);
    }

    pub fn pop(&mut self) -> Option<Task> {
        let task = self.heap.pop()?.task;
        self.dequeued_count += 1;
        Some(task)
    }

    pub fn peek(&self) -> Option<&Task> {
        self.heap.peek().map(|p| &p.task)
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.heap
            .iter()
            .map(|p| &p.task)
            .find(|t| t.task_id == task_id)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            current_size: self.heap.len(),
            enqueued_total: self.enqueued_count,
            dequeued_total: self.dequeued_count,
            ..Default::default()
        };
        for item in self.heap.iter() {
            match item.task.priority {
                TaskPriority::Critical => stats.critical_count += 1,
                TaskPriority::High => stats.high_count += 1,
                TaskPriority::Normal => stats.normal_count += 1,
                TaskPriority::Low => stats.low_count += 1,
            }
        }
        stats
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub current_size: usize,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    pub critical_count: usize,
    pub high_count: usize,
    pub normal_count: usize,
    pub low_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering() {
        let mut queue = TaskQueue::new();
        queue.push(Task::new("a", json!(1), TaskPriority::Low));
        queue.push(Task::new("b", json!(2), TaskPriority::Critical));
        queue.push(Task::new("c", json!(3), TaskPriority::Normal));
        queue.push(Task::new("d", json!(4), TaskPriority::High));

        let order: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|t| t.task_type)
            .collect();
        assert_eq!(order, vec!["b", "d", "c", "a"]);
    }

    #[test]
    fn test_fifo_within_priority() {
        let mut queue = TaskQueue::new();
        for i in 0..5 {
            queue.push(Task::new(format!("t{}", i), json!(i), TaskPriority::Normal));
        }
        for i in 0..5 {
            assert_eq!(queue.pop().unwrap().task_type, format!("t{}", i));
        }
    }

    #[test]
    fn test_requeue_keeps_place() {
        let mut queue = TaskQueue::new();
        queue.push(Task::new("first", json!(1), TaskPriority::Normal));
        queue.push(Task::new("second", json!(2), TaskPriority::Normal));

        let first = queue.pop().unwrap();
        queue.requeue(first);
        assert_eq!(queue.peek().unwrap().task_type, "first");

        let stats = queue.stats();
        assert_eq!(stats.current_size, 2);
        assert_eq!(stats.enqueued_total, 2);
        assert_eq!(stats.dequeued_total, 0);
        assert_eq!(stats.normal_count, 2);
    }
}
