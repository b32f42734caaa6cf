//! In-process queue backend.
//!
//! Mirrors [`super::RedisQueue`] list for list: pending jobs enter at the
//! front and leave at the back, retries re-enter at the back. State lives
//! behind one mutex, so flow bookkeeping is atomic the same way the Redis
//! script is. Used when `REDIS_URL` is unset and by the test suite.
//!
//! Child outcomes are kept only while their parent is outstanding: they are
//! dropped once the parent job completes or is dead-lettered. Return values
//! of jobs without a parent are not retained.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::debug;
use uuid::Uuid;

use super::backend::{dead_letter_entry, QueueBackend, QueueError, QueueStats};
use super::job::{ChildOutcome, Flow, Job};

#[derive(Default)]
struct NamedQueue {
    pending: VecDeque<Job>,
    processing: Vec<Job>,
    dead_letter: VecDeque<serde_json::Value>,
}

struct PendingFlow {
    parent: Job,
    remaining: usize,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, NamedQueue>,
    flows: HashMap<Uuid, PendingFlow>,
    outcomes: HashMap<Uuid, HashMap<Uuid, ChildOutcome>>,
}

impl State {
    fn queue(&mut self, name: &str) -> &mut NamedQueue {
        self.queues.entry(name.to_string()).or_default()
    }

    fn take_processing(&mut self, job: &Job) {
        let queue = self.queue(&job.queue_name);
        if let Some(pos) = queue.processing.iter().position(|held| held.id == job.id) {
            queue.processing.remove(pos);
        }
    }

    /// Records a child outcome. Returns true when the parent was released.
    fn finish_child(&mut self, job: &Job, outcome: ChildOutcome) -> bool {
        let Some(parent) = &job.parent else {
            return false;
        };
        let parent_id = parent.id;

        // A report arriving after the parent finished has nowhere to go.
        if !self.flows.contains_key(&parent_id) && !self.outcomes.contains_key(&parent_id) {
            return false;
        }
        let outcomes = self.outcomes.entry(parent_id).or_default();
        if outcomes.contains_key(&job.id) {
            return false;
        }
        outcomes.insert(job.id, outcome);

        let Some(flow) = self.flows.get_mut(&parent_id) else {
            return false;
        };
        flow.remaining = flow.remaining.saturating_sub(1);
        if flow.remaining > 0 {
            return false;
        }

        match self.flows.remove(&parent_id) {
            Some(flow) => {
                let queue_name = flow.parent.queue_name.clone();
                self.queue(&queue_name).pending.push_front(flow.parent);
                true
            }
            None => false,
        }
    }

    /// Forgets the child outcomes of a job that reached a final state.
    fn forget_flow(&mut self, job: &Job) {
        if self.outcomes.remove(&job.id).is_some() {
            debug!(job_id = %job.id, "Flow finished; child outcomes dropped");
        }
    }
}

/// Queue backend held entirely in memory.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_pop(&self, queue: &str) -> Option<Job> {
        let mut state = self.state.lock().await;
        let named = state.queue(queue);
        let job = named.pending.pop_back()?;
        named.processing.push(job.clone());
        Some(job)
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    fn name(&self) -> &str {
        "memory"
    }

    async fn add_flow(&self, flow: Flow) -> Result<(), QueueError> {
        if flow.children.is_empty() {
            return self.enqueue(flow.parent).await;
        }

        {
            let mut state = self.state.lock().await;
            state.flows.insert(
                flow.parent.id,
                PendingFlow {
                    parent: flow.parent,
                    remaining: flow.children.len(),
                },
            );
            for child in flow.children {
                let queue_name = child.queue_name.clone();
                state.queue(&queue_name).pending.push_front(child);
            }
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn enqueue(&self, job: Job) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            let queue_name = job.queue_name.clone();
            state.queue(&queue_name).pending.push_front(job);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent push is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.try_pop(queue).await {
                return Ok(Some(job));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.try_pop(queue).await);
            }
        }
    }

    async fn complete(&self, job: &Job, return_value: serde_json::Value) -> Result<(), QueueError> {
        let released = {
            let mut state = self.state.lock().await;
            let released = state.finish_child(job, ChildOutcome::completed(job, return_value));
            state.take_processing(job);
            state.forget_flow(job);
            released
        };
        if released {
            debug!(job_id = %job.id, "Last child completed; parent released");
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn retry(&self, job: Job) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock().await;
            state.take_processing(&job);
            let queue_name = job.queue_name.clone();
            state.queue(&queue_name).pending.push_back(job);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    async fn fail(&self, job: &Job, error: &str) -> Result<(), QueueError> {
        let released = {
            let mut state = self.state.lock().await;
            let entry = dead_letter_entry(job, error);
            state.queue(&job.queue_name).dead_letter.push_front(entry);
            let released = state.finish_child(job, ChildOutcome::failed(job, error));
            state.take_processing(job);
            state.forget_flow(job);
            released
        };
        if released {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    async fn child_outcomes(&self, parent_id: Uuid) -> Result<Vec<ChildOutcome>, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .outcomes
            .get(&parent_id)
            .map(|outcomes| outcomes.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn recover_processing(&self, queue: &str) -> Result<usize, QueueError> {
        let held = {
            let mut state = self.state.lock().await;
            std::mem::take(&mut state.queue(queue).processing)
        };

        let mut recovered = 0;
        for mut job in held {
            job.increment_attempts();
            if job.should_retry() {
                let mut state = self.state.lock().await;
                state.queue(queue).pending.push_back(job);
                recovered += 1;
            } else {
                self.fail(&job, "Recovered from processing queue after max attempts")
                    .await?;
            }
        }

        if recovered > 0 {
            self.notify.notify_waiters();
        }
        Ok(recovered)
    }

    async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let mut state = self.state.lock().await;
        let named = state.queue(queue);
        Ok(QueueStats {
            queue_name: queue.to_string(),
            pending_jobs: named.pending.len(),
            processing_jobs: named.processing.len(),
            dead_letter_jobs: named.dead_letter.len(),
        })
    }

    async fn peek_dead_letter(
        &self,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>, QueueError> {
        let mut state = self.state.lock().await;
        Ok(state
            .queue(queue)
            .dead_letter
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{
        ARCHITECTURAL_QUEUE, EVALUATION_FLOW_QUEUE, RATIONALE_QUEUE, TESTING_QUEUE,
    };
    use crate::scheduler::job::ChildStatus;
    use serde_json::json;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    fn evaluation_flow() -> (Flow, Uuid) {
        let parent = Job::new(EVALUATION_FLOW_QUEUE, json!({}));
        let id = parent.id;
        let flow = Flow::new(parent)
            .with_child(Job::new(RATIONALE_QUEUE, json!({})))
            .with_child(Job::new(ARCHITECTURAL_QUEUE, json!({})))
            .with_child(Job::new(TESTING_QUEUE, json!({})));
        (flow, id)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = MemoryQueue::new();
        let first = Job::new("q", json!(1));
        let second = Job::new("q", json!(2));
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        assert_eq!(queue.dequeue("q", SHORT).await.unwrap().unwrap().id, first.id);
        assert_eq!(queue.dequeue("q", SHORT).await.unwrap().unwrap().id, second.id);
        assert!(queue.dequeue("q", SHORT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_parent_waits_for_every_child() {
        let queue = MemoryQueue::new();
        let (flow, parent_id) = evaluation_flow();
        queue.add_flow(flow).await.unwrap();

        assert!(queue.dequeue(EVALUATION_FLOW_QUEUE, SHORT).await.unwrap().is_none());

        let rationale = queue.dequeue(RATIONALE_QUEUE, SHORT).await.unwrap().unwrap();
        queue.complete(&rationale, json!({"score": 1.0})).await.unwrap();
        let architectural = queue.dequeue(ARCHITECTURAL_QUEUE, SHORT).await.unwrap().unwrap();
        queue.complete(&architectural, json!({"score": 0.8})).await.unwrap();
        assert!(queue.dequeue(EVALUATION_FLOW_QUEUE, SHORT).await.unwrap().is_none());

        let testing = queue.dequeue(TESTING_QUEUE, SHORT).await.unwrap().unwrap();
        queue.fail(&testing, "sandbox exploded").await.unwrap();

        let parent = queue.dequeue(EVALUATION_FLOW_QUEUE, SHORT).await.unwrap().unwrap();
        assert_eq!(parent.id, parent_id);

        let outcomes = queue.child_outcomes(parent_id).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        let failed: Vec<_> = outcomes
            .iter()
            .filter(|o| o.status == ChildStatus::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].queue_name, TESTING_QUEUE);
    }

    #[tokio::test]
    async fn test_duplicate_child_report_is_ignored() {
        let queue = MemoryQueue::new();
        let parent = Job::new(EVALUATION_FLOW_QUEUE, json!({}));
        let parent_id = parent.id;
        let flow = Flow::new(parent)
            .with_child(Job::new(RATIONALE_QUEUE, json!({})))
            .with_child(Job::new(TESTING_QUEUE, json!({})));
        queue.add_flow(flow).await.unwrap();

        let rationale = queue.dequeue(RATIONALE_QUEUE, SHORT).await.unwrap().unwrap();
        queue.complete(&rationale, json!({"first": true})).await.unwrap();
        queue.complete(&rationale, json!({"first": false})).await.unwrap();

        // The duplicate must not stand in for the unfinished testing child.
        assert!(queue.dequeue(EVALUATION_FLOW_QUEUE, SHORT).await.unwrap().is_none());
        let outcomes = queue.child_outcomes(parent_id).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].return_value, Some(json!({"first": true})));
    }

    #[tokio::test]
    async fn test_finished_flows_leave_no_state_behind() {
        let queue = MemoryQueue::new();
        for round in 0..50 {
            let (flow, parent_id) = evaluation_flow();
            queue.add_flow(flow).await.unwrap();
            for name in [RATIONALE_QUEUE, ARCHITECTURAL_QUEUE, TESTING_QUEUE] {
                let child = queue.dequeue(name, SHORT).await.unwrap().unwrap();
                queue.complete(&child, json!({"round": round})).await.unwrap();
            }
            let parent = queue.dequeue(EVALUATION_FLOW_QUEUE, SHORT).await.unwrap().unwrap();
            assert_eq!(queue.child_outcomes(parent_id).await.unwrap().len(), 3);
            if round % 2 == 0 {
                queue.complete(&parent, json!({"done": true})).await.unwrap();
            } else {
                queue.fail(&parent, "aggregation failed").await.unwrap();
            }
            assert!(queue.child_outcomes(parent_id).await.unwrap().is_empty());
        }

        let state = queue.state.lock().await;
        assert!(state.outcomes.is_empty());
        assert!(state.flows.is_empty());
        assert!(state.queues.values().all(|q| q.processing.is_empty() && q.pending.is_empty()));
    }

    #[tokio::test]
    async fn test_late_child_report_after_parent_finished_is_dropped() {
        let queue = MemoryQueue::new();
        let parent = Job::new(EVALUATION_FLOW_QUEUE, json!({}));
        let parent_id = parent.id;
        queue
            .add_flow(Flow::new(parent).with_child(Job::new(RATIONALE_QUEUE, json!({}))))
            .await
            .unwrap();

        let child = queue.dequeue(RATIONALE_QUEUE, SHORT).await.unwrap().unwrap();
        queue.complete(&child, json!({})).await.unwrap();
        let parent = queue.dequeue(EVALUATION_FLOW_QUEUE, SHORT).await.unwrap().unwrap();
        queue.complete(&parent, json!({})).await.unwrap();

        queue.complete(&child, json!({"late": true})).await.unwrap();
        assert!(queue.child_outcomes(parent_id).await.unwrap().is_empty());
        assert!(queue.state.lock().await.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_childless_flow_releases_parent() {
        let queue = MemoryQueue::new();
        let parent = Job::new(EVALUATION_FLOW_QUEUE, json!({}));
        queue.add_flow(Flow::new(parent.clone())).await.unwrap();
        let released = queue.dequeue(EVALUATION_FLOW_QUEUE, SHORT).await.unwrap().unwrap();
        assert_eq!(released.id, parent.id);
    }

    #[tokio::test]
    async fn test_retry_and_dead_letter_accounting() {
        let queue = MemoryQueue::new();
        queue.enqueue(Job::new("q", json!({}))).await.unwrap();

        let job = queue.dequeue("q", SHORT).await.unwrap().unwrap();
        let stats = queue.stats("q").await.unwrap();
        assert_eq!((stats.pending_jobs, stats.processing_jobs), (0, 1));

        queue.retry(job).await.unwrap();
        let job = queue.dequeue("q", SHORT).await.unwrap().unwrap();
        queue.fail(&job, "gave up").await.unwrap();

        let stats = queue.stats("q").await.unwrap();
        assert_eq!(stats.total_jobs(), 1);
        assert_eq!(stats.dead_letter_jobs, 1);
        let entries = queue.peek_dead_letter("q", 10).await.unwrap();
        assert_eq!(entries[0]["error"], "gave up");
    }

    #[tokio::test]
    async fn test_recover_processing() {
        let queue = MemoryQueue::new();
        queue
            .enqueue(Job::new("q", json!({})).with_max_attempts(1))
            .await
            .unwrap();
        queue.enqueue(Job::new("q", json!({}))).await.unwrap();
        queue.dequeue("q", SHORT).await.unwrap().unwrap();
        queue.dequeue("q", SHORT).await.unwrap().unwrap();

        assert_eq!(queue.recover_processing("q").await.unwrap(), 1);
        let stats = queue.stats("q").await.unwrap();
        assert_eq!(stats.pending_jobs, 1);
        assert_eq!(stats.processing_jobs, 0);
        assert_eq!(stats.dead_letter_jobs, 1);
    }

    #[tokio::test]
    async fn test_blocked_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue("q", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(Job::new("q", json!({}))).await.unwrap();

        let job = waiter.await.unwrap().unwrap();
        assert!(job.is_some());
    }
}
