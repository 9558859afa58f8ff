/// chat.rs – Client for the assistant chat socket (`/ws/chat`).
///
/// The server keeps one transcript and answers every message with the whole
/// of it as a JSON array of `{role, content}`. Sending `__clear__` wipes it.
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ClientError;
use crate::stream::{StreamConnector, StreamControl, StreamEvent};

pub const CLEAR_SENTINEL: &str = "__clear__";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn is_reply(&self) -> bool {
        self.role == "ai" || self.role == "assistant"
    }
}

pub struct ChatClient {
    thread_id: Uuid,
    control: StreamControl,
    events: mpsc::Receiver<StreamEvent>,
    transcript: Vec<ChatMessage>,
}

impl ChatClient {
    pub fn connect(connector: &dyn StreamConnector) -> Result<Self, ClientError> {
        let (control, events) = connector.chat_stream()?.split();
        let thread_id = Uuid::new_v4();
        debug!("Chat thread {thread_id} opened");
        Ok(Self {
            thread_id,
            control,
            events,
            transcript: Vec::new(),
        })
    }

    pub fn thread_id(&self) -> Uuid {
        self.thread_id
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn send(&self, text: &str) -> Result<(), ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ClientError::MissingParameter("message"));
        }
        self.control.send_text(text)
    }

    /// Ask the server to forget the conversation.
    pub fn clear(&mut self) -> Result<(), ClientError> {
        self.control.send_text(CLEAR_SENTINEL)?;
        self.transcript.clear();
        Ok(())
    }

    /// Wait for the next assistant reply. `None` once the socket is closed.
    pub async fn next_reply(&mut self) -> Option<ChatMessage> {
        while let Some(event) = self.events.recv().await {
            match event {
                StreamEvent::Frame(text) => {
                    let Ok(log) = serde_json::from_str::<Vec<ChatMessage>>(&text) else {
                        warn!("Unexpected chat frame: {text}");
                        continue;
                    };
                    self.transcript = log;
                    if let Some(last) = self.transcript.last().filter(|m| m.is_reply()) {
                        return Some(last.clone());
                    }
                }
                StreamEvent::Error(e) => warn!("Chat socket error: {e}"),
                StreamEvent::Closed => return None,
                StreamEvent::Opened => {}
            }
        }
        None
    }

    pub fn close(self) {
        self.control.close();
    }
}
