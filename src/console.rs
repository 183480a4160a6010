//! One-shot console port: asks a single question and streams the answer.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use vsm_core::{Message, MessageKind, SessionId};
use vsm_runtime::{Capsule, Port, RuntimeError};

pub struct ConsolePort {
    session_id: SessionId,
    prompt: String,
    streamed: AtomicBool,
    answered: Notify,
}

impl ConsolePort {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            session_id: SessionId::new(),
            prompt: prompt.into(),
            streamed: AtomicBool::new(false),
            answered: Notify::new(),
        }
    }

    fn owns(&self, message: &Message) -> bool {
        message.session_id() == Some(&self.session_id)
    }
}

#[async_trait]
impl Port for ConsolePort {
    fn name(&self) -> &str {
        "console"
    }

    fn should_render(&self, message: &Message) -> bool {
        self.owns(message)
            && matches!(
                message.kind,
                MessageKind::AssistantDelta | MessageKind::Assistant | MessageKind::ToolCall
            )
    }

    fn render_out(&self, message: &Message) {
        let mut out = std::io::stdout().lock();
        match message.kind {
            MessageKind::AssistantDelta => {
                self.streamed.store(true, Ordering::SeqCst);
                let _ = write!(out, "{}", message.payload_text());
            }
            MessageKind::ToolCall => {
                if self.streamed.swap(false, Ordering::SeqCst) {
                    let _ = writeln!(out);
                }
                let _ = writeln!(out, "[tool] {}", message.payload_text());
            }
            MessageKind::Assistant => {
                if self.streamed.swap(false, Ordering::SeqCst) {
                    let _ = writeln!(out);
                } else {
                    let _ = writeln!(out, "{}", message.payload_text());
                }
                self.answered.notify_one();
            }
            _ => {}
        }
        let _ = out.flush();
    }

    async fn run(&self, capsule: Arc<Capsule>) -> Result<(), RuntimeError> {
        capsule.ask(&self.session_id, self.prompt.clone()).await;
        // The final answer may still be queued for rendering.
        self.answered.notified().await;
        Ok(())
    }
}
