use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::message::{FieldValue, RecordKey, WriteCommand};
use crate::sink::{Ack, Sink, SinkError};

#[derive(Default)]
struct StubTable {
    rows: BTreeMap<RecordKey, Vec<FieldValue>>,
    /// Every successful write in the order it was applied.
    writes: Vec<WriteCommand>,
    attempts: usize,
    scripted: VecDeque<SinkError>,
    always: Option<SinkError>,
    latency: Option<Duration>,
}

/// In-memory table with upsert semantics. Failures can be scripted per attempt. Clones share the
/// same table.
#[derive(Clone, Default)]
pub(crate) struct StubSink {
    table: Arc<Mutex<StubTable>>,
}

impl StubSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The next attempts fail with `errors`, in order.
    pub(crate) fn fail_with(self, errors: impl IntoIterator<Item = SinkError>) -> Self {
        self.table.lock().scripted.extend(errors);
        self
    }

    /// Every attempt fails with `error`.
    pub(crate) fn always_fail(self, error: SinkError) -> Self {
        self.table.lock().always = Some(error);
        self
    }

    /// Every attempt takes at least `latency`.
    pub(crate) fn with_latency(self, latency: Duration) -> Self {
        self.table.lock().latency = Some(latency);
        self
    }

    pub(crate) fn rows(&self) -> BTreeMap<RecordKey, Vec<FieldValue>> {
        self.table.lock().rows.clone()
    }

    pub(crate) fn writes(&self) -> Vec<WriteCommand> {
        self.table.lock().writes.clone()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.table.lock().attempts
    }
}

impl Sink for StubSink {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn write(&mut self, command: &WriteCommand) -> Result<Ack, SinkError> {
        let latency = self.table.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut table = self.table.lock();
        table.attempts += 1;
        if let Some(error) = table.scripted.pop_front() {
            return Err(error);
        }
        if let Some(error) = table.always.clone() {
            return Err(error);
        }
        table
            .rows
            .insert(command.key.clone(), command.values.clone());
        table.writes.push(command.clone());
        Ok(Ack { rows_affected: 1 })
    }
}
