//! Deferred units of work.
//!
//! Anything slow or externally facing (a discovery run, a browser submission)
//! is scheduled as a [`Task`] instead of running inside the request that
//! triggered it. Delivery is at-least-once, so every handler must tolerate
//! seeing the same task twice.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::clock::Pacer;
use crate::models::RunSource;

#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    Discover { user_id: String, source: RunSource },
    AutoApply { user_id: String },
    Submit { application_id: i64, user_id: String },
}

impl Task {
    pub fn user_id(&self) -> &str {
        match self {
            Task::Discover { user_id, .. } | Task::AutoApply { user_id } | Task::Submit { user_id, .. } => user_id,
        }
    }
}

pub trait TaskQueue: Send + Sync {
    /// Fire-and-forget: the task runs no sooner than `delay` from now.
    fn schedule_after(&self, delay: Duration, task: Task) -> Result<()>;
}

/// In-process queue backed by an unbounded tokio channel. Delayed tasks wait
/// in their own spawned timer and are pushed onto the channel when due.
pub struct ChannelQueue {
    tx: UnboundedSender<Task>,
    pacer: Arc<dyn Pacer>,
}

impl ChannelQueue {
    pub fn new(pacer: Arc<dyn Pacer>) -> (Self, UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, pacer }, rx)
    }
}

impl TaskQueue for ChannelQueue {
    fn schedule_after(&self, delay: Duration, task: Task) -> Result<()> {
        if delay.is_zero() {
            return self
                .tx
                .send(task)
                .map_err(|_| anyhow!("Task queue is closed"));
        }

        let tx = self.tx.clone();
        let pacer = self.pacer.clone();
        tokio::spawn(async move {
            pacer.pause(delay).await;
            if tx.send(task).is_err() {
                tracing::warn!("Task queue closed before a delayed task became due");
            }
        });
        Ok(())
    }
}
