use boba_daemon_error::DaemonError;
use serde_json::Value;

use crate::protocol::{AgentOutput, ContentBlock, ToolUse};

/// Classified content of one agent stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum DemuxEvent {
    /// `system/init`; carries the agent's internal session id.
    Init { agent_session_id: String },
    /// Concatenated text blocks of one assistant message.
    Text(String),
    ToolUse(ToolUse),
    /// A `result` envelope closed the current turn.
    TurnCompleted { is_error: bool },
}

/// Splits raw byte chunks into complete lines, carrying partial lines over.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        // Carried-over bytes never contain a newline; only the new chunk is scanned.
        let mut search_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut line_start = 0;
        while let Some(offset) = self.pending[search_from..].iter().position(|byte| *byte == b'\n') {
            let newline = search_from + offset;
            let mut line = &self.pending[line_start..newline];
            if let Some((&b'\r', rest)) = line.split_last() {
                line = rest;
            }
            lines.push(line.to_vec());
            line_start = newline + 1;
            search_from = line_start;
        }
        if line_start > 0 {
            self.pending.drain(..line_start);
        }
        lines
    }

    /// Bytes held for an unterminated trailing line.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Per-session demultiplexer owned by the task that pumps one process's stdout.
#[derive(Debug)]
pub struct Demultiplexer {
    session_id: String,
    buffer: LineBuffer,
    line_count: u64,
    malformed_lines: u64,
}

impl Demultiplexer {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            buffer: LineBuffer::new(),
            line_count: 0,
            malformed_lines: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Lines dropped because they were not valid UTF-8 JSON.
    pub fn malformed_lines(&self) -> u64 {
        self.malformed_lines
    }

    /// Feeds one stdout chunk and returns the events of every line it completed,
    /// in source order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DemuxEvent> {
        let mut events = Vec::new();
        for line in self.buffer.push(chunk) {
            self.line_count += 1;
            if let Err(err) = self.classify_line(&line, &mut events) {
                self.malformed_lines += 1;
                tracing::warn!(
                    session_id = %self.session_id,
                    line_number = self.line_count,
                    error = %err,
                    "agent stdout: dropping line"
                );
            }
        }
        events
    }

    fn malformed(&self, message: String) -> DaemonError {
        DaemonError::MalformedLine {
            session_id: self.session_id.clone(),
            message,
        }
    }

    fn classify_line(&self, line: &[u8], events: &mut Vec<DemuxEvent>) -> Result<(), DaemonError> {
        let text = std::str::from_utf8(line)
            .map_err(|err| self.malformed(format!("not valid UTF-8: {err}")))?
            .trim();
        if text.is_empty() {
            return Ok(());
        }

        let value = serde_json::from_str::<Value>(text)
            .map_err(|err| self.malformed(format!("invalid JSON ({err}): {}", truncate(text, 200))))?;

        let output = match serde_json::from_value::<AgentOutput>(value) {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!(
                    session_id = %self.session_id,
                    line_number = self.line_count,
                    error = %err,
                    "agent stdout: unhandled message type"
                );
                return Ok(());
            }
        };

        match output {
            AgentOutput::System(system) => {
                if let Some(agent_session_id) = system.init_session_id() {
                    events.push(DemuxEvent::Init {
                        agent_session_id: agent_session_id.to_string(),
                    });
                }
            }
            AgentOutput::Assistant(assistant) => {
                let mut text = String::new();
                let mut tools = Vec::new();
                for block in assistant.message.content {
                    match block {
                        ContentBlock::Text { text: chunk } => text.push_str(&chunk),
                        ContentBlock::ToolUse { id, name, input } => {
                            tools.push(ToolUse::new(id, name, input))
                        }
                        ContentBlock::Other => {}
                    }
                }
                if !text.is_empty() {
                    events.push(DemuxEvent::Text(text));
                }
                events.extend(tools.into_iter().map(DemuxEvent::ToolUse));
            }
            AgentOutput::Result(result) => {
                events.push(DemuxEvent::TurnCompleted {
                    is_error: result.is_error,
                });
            }
        }
        Ok(())
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}
