//! Singer message runner
//!
//! Reads messages line by line, routes them to per-stream sinks and writes the latest STATE to
//! the output once every sink has been drained.

use crate::config::TargetConfig;
use crate::destination::Destination;
use crate::error::{Result, TargetError};
use crate::singer::Message;
use crate::sink::Sink;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Totals of one run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub messages: u64,
    pub records_received: u64,
    pub records_written: u64,
    pub records_dropped: u64,
    pub versions_activated: u64,
    pub states_emitted: u64,
}

pub struct Target {
    config: TargetConfig,
    destination: Arc<dyn Destination>,
    sinks: BTreeMap<String, Sink>,
    pending_state: Option<serde_json::Value>,
    summary: RunSummary,
}

impl Target {
    pub fn new(config: TargetConfig, destination: Arc<dyn Destination>) -> Result<Self> {
        let schema_name = config
            .default_target_schema
            .clone()
            .unwrap_or_else(|| config.database.clone());
        destination.prepare_schema(&schema_name)?;

        Ok(Self {
            config,
            destination,
            sinks: BTreeMap::new(),
            pending_state: None,
            summary: RunSummary::default(),
        })
    }

    pub fn sink(&self, stream: &str) -> Option<&Sink> {
        self.sinks.get(stream)
    }

    /// Process every message of `input`, then drain all sinks and emit the final state
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> Result<RunSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let message = Message::parse(&line)?;
            self.summary.messages += 1;
            self.handle(message).await?;
        }

        self.drain_all().await?;
        self.emit_state(&mut output).await?;
        output.flush().await?;

        for sink in self.sinks.values() {
            let stats = sink.stats();
            self.summary.records_received += stats.received;
            self.summary.records_written += stats.written;
            self.summary.records_dropped += stats.dropped;
        }

        info!(
            messages = self.summary.messages,
            received = self.summary.records_received,
            written = self.summary.records_written,
            dropped = self.summary.records_dropped,
            "Run complete"
        );
        Ok(self.summary.clone())
    }

    pub async fn handle(&mut self, message: Message) -> Result<()> {
        match message {
            Message::Schema(schema) => {
                if let Some(existing) = self.sinks.get(&schema.stream) {
                    if existing.is_same_definition(&schema.schema, &schema.key_properties) {
                        debug!(stream = %schema.stream, "Schema unchanged");
                        return Ok(());
                    }
                }

                let mut sink = Sink::new(
                    &schema.stream,
                    &schema.schema,
                    schema.key_properties,
                    &self.config,
                )?;
                if let Some(mut previous) = self.sinks.remove(&schema.stream) {
                    info!(stream = %schema.stream, "Schema changed, draining previous sink");
                    previous.drain(self.destination.as_ref()).await?;
                    self.accumulate(&previous);
                    if let Some(version) = previous.version() {
                        sink.set_version(version);
                    }
                }
                self.sinks.insert(schema.stream, sink);
            }
            Message::Record(record) => {
                let destination = self.destination.clone();
                let sink = self.sinks.get_mut(&record.stream).ok_or_else(|| {
                    TargetError::Schema(format!(
                        "Record for stream '{}' arrived before its schema",
                        record.stream
                    ))
                })?;
                let full = sink.process_record(
                    record.record,
                    record.version,
                    record.time_extracted.as_deref(),
                );
                if full {
                    sink.drain(destination.as_ref()).await?;
                }
            }
            Message::State(state) => {
                self.pending_state = Some(state.value);
            }
            Message::ActivateVersion(activate) => {
                let destination = self.destination.clone();
                let sink = self.sinks.get_mut(&activate.stream).ok_or_else(|| {
                    TargetError::Schema(format!(
                        "ACTIVATE_VERSION for stream '{}' arrived before its schema",
                        activate.stream
                    ))
                })?;
                sink.activate_version(destination.as_ref(), activate.version).await?;
                self.summary.versions_activated += 1;
            }
            Message::Batch { stream } => {
                warn!(stream = %stream, "BATCH messages are not supported, skipping");
            }
        }
        Ok(())
    }

    /// Counters of a replaced sink, folded in before it is dropped
    fn accumulate(&mut self, sink: &Sink) {
        let stats = sink.stats();
        self.summary.records_received += stats.received;
        self.summary.records_written += stats.written;
        self.summary.records_dropped += stats.dropped;
    }

    pub async fn drain_all(&mut self) -> Result<()> {
        for sink in self.sinks.values_mut() {
            sink.drain(self.destination.as_ref()).await?;
        }
        Ok(())
    }

    async fn emit_state<W: AsyncWrite + Unpin>(&mut self, output: &mut W) -> Result<()> {
        let Some(state) = self.pending_state.take() else {
            return Ok(());
        };
        let line = serde_json::to_string(&state)?;
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        self.summary.states_emitted += 1;
        debug!("Emitted state");
        Ok(())
    }
}
