use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::{Offset, RawMessage};
use crate::Result;
use crate::source::{CommitError, LagReader, SourceAcker, SourceReader};

pub(crate) const TEST_TOPIC: &str = "carga_topic";

pub(crate) fn message(partition: i32, offset: i64, payload: &str) -> RawMessage {
    RawMessage {
        topic: TEST_TOPIC.to_string(),
        partition,
        offset,
        timestamp: None,
        key: None,
        headers: HashMap::new(),
        payload: Bytes::from(payload.to_string()),
    }
}

#[derive(Default)]
struct StubState {
    queue: VecDeque<RawMessage>,
    commits: Vec<Offset>,
    keep_open: bool,
    /// Errors for the next commit attempts, in order.
    commit_failures: VecDeque<CommitError>,
    always_fail_commits: Option<CommitError>,
    commit_attempts: usize,
}

/// In-memory stream. Hands out one message per read and records every commit. Clones share
/// the same state, so the same stub can be the reader, the acker and the lag reader.
#[derive(Clone, Default)]
pub(crate) struct StubSource {
    state: Arc<Mutex<StubState>>,
}

impl StubSource {
    pub(crate) fn new(messages: Vec<RawMessage>) -> Self {
        Self {
            state: Arc::new(Mutex::new(StubState {
                queue: messages.into(),
                ..Default::default()
            })),
        }
    }

    /// Keep returning empty batches instead of ending the stream once the queue is drained.
    pub(crate) fn keep_open(self) -> Self {
        self.state.lock().keep_open = true;
        self
    }

    /// The next commit attempts fail with `errors`, in order.
    pub(crate) fn fail_commits_with(self, errors: impl IntoIterator<Item = CommitError>) -> Self {
        self.state.lock().commit_failures.extend(errors);
        self
    }

    /// Every commit attempt fails with `error`.
    pub(crate) fn always_fail_commits(self, error: CommitError) -> Self {
        self.state.lock().always_fail_commits = Some(error);
        self
    }

    pub(crate) fn commit_attempts(&self) -> usize {
        self.state.lock().commit_attempts
    }

    pub(crate) fn commits(&self) -> Vec<Offset> {
        self.state.lock().commits.clone()
    }
}

impl SourceReader for StubSource {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn read(&mut self) -> Result<Option<Vec<RawMessage>>> {
        let (next, keep_open) = {
            let mut state = self.state.lock();
            (state.queue.pop_front(), state.keep_open)
        };
        match next {
            Some(message) => Ok(Some(vec![message])),
            None if keep_open => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Some(vec![]))
            }
            None => Ok(None),
        }
    }
}

impl SourceAcker for StubSource {
    async fn commit(&mut self, offset: Offset) -> std::result::Result<(), CommitError> {
        let mut state = self.state.lock();
        state.commit_attempts += 1;
        if let Some(error) = state.commit_failures.pop_front() {
            return Err(error);
        }
        if let Some(error) = state.always_fail_commits.clone() {
            return Err(error);
        }
        state.commits.push(offset);
        Ok(())
    }
}

impl LagReader for StubSource {
    async fn pending(&mut self) -> Result<Option<usize>> {
        Ok(Some(self.state.lock().queue.len()))
    }
}
