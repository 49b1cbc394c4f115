// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`CliAdapter`] — stdin/stdout channel, for local testing and the
//! `vargos` CLI's interactive mode.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::adapter::{ChannelAdapter, InboundMessage, InboundSink};

/// Sender id every CLI-adapter message carries — there is exactly one user
/// on the other end of stdin.
pub const CLI_SENDER_ID: &str = "local";

pub struct CliAdapter {
    sink: Arc<dyn InboundSink>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl CliAdapter {
    pub fn new(sink: Arc<dyn InboundSink>) -> Self {
        Self { sink, reader_task: Mutex::new(None) }
    }
}

#[async_trait]
impl ChannelAdapter for CliAdapter {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> anyhow::Result<()> {
        let sink = self.sink.clone();
        let handle = tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let mut lines = BufReader::new(stdin).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        sink.on_inbound(
                            "cli",
                            InboundMessage {
                                msg_id: Uuid::new_v4().to_string(),
                                sender_id: CLI_SENDER_ID.to_string(),
                                is_self: false,
                                is_group: false,
                                text: Some(line),
                                media: None,
                            },
                        )
                        .await;
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "cli adapter: stdin read error");
                        break;
                    }
                }
            }
        });
        *self.reader_task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if let Some(handle) = self.reader_task.lock().await.take() {
            handle.abort();
        }
        Ok(())
    }

    async fn send(&self, _user_id: &str, text: &str) -> anyhow::Result<()> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(text.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingSink(Arc<StdMutex<Vec<InboundMessage>>>);

    #[async_trait]
    impl InboundSink for RecordingSink {
        async fn on_inbound(&self, _channel: &str, message: InboundMessage) {
            self.0.lock().unwrap().push(message);
        }
    }

    #[tokio::test]
    async fn send_writes_newline_terminated_text_to_stdout() {
        let sink = Arc::new(RecordingSink(Arc::new(StdMutex::new(Vec::new()))));
        let adapter = CliAdapter::new(sink);
        assert!(adapter.send("local", "hello").await.is_ok());
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let sink = Arc::new(RecordingSink(Arc::new(StdMutex::new(Vec::new()))));
        let adapter = CliAdapter::new(sink);
        assert!(adapter.stop().await.is_ok());
    }
}
