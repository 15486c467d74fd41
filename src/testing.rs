//! In-memory fakes for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::channels::{ChatTransport, EventStream};
use crate::device::DeviceTrigger;
use crate::error::{ChannelError, DeviceError, LlmError};
use crate::llm::{CompletionRequest, CompletionResponse, FinishReason, LlmProvider};

pub(crate) const BOT_USER: &str = "@bot:example.org";
pub(crate) const BOT_ROOM: &str = "!room:example.org";

/// Transport that records every successful send.
#[derive(Default)]
pub(crate) struct RecordingTransport {
    sent: Mutex<Vec<(String, String)>>,
    fail_sends: bool,
}

impl RecordingTransport {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport whose sends all fail.
    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: true,
        })
    }

    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_rooms(&self) -> Vec<String> {
        self.sent().into_iter().map(|(room, _)| room).collect()
    }

    pub(crate) fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, text)| text).collect()
    }
}

#[async_trait]
impl ChatTransport for RecordingTransport {
    async fn login(&self) -> Result<String, ChannelError> {
        Ok(BOT_USER.to_string())
    }

    async fn join_room(&self, _alias: &str) -> Result<String, ChannelError> {
        Ok(BOT_ROOM.to_string())
    }

    async fn send_message(&self, room_id: &str, text: &str) -> Result<(), ChannelError> {
        if self.fail_sends {
            return Err(ChannelError::SendFailed {
                name: "recording".to_string(),
                reason: "send disabled".to_string(),
            });
        }
        self.sent
            .lock()
            .unwrap()
            .push((room_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn start(&self, _poll_interval: Duration) -> Result<EventStream, ChannelError> {
        Ok(Box::pin(futures::stream::empty()))
    }
}

/// Device that records the arguments it was invoked with.
#[derive(Default)]
pub(crate) struct RecordingDevice {
    calls: Mutex<Vec<String>>,
}

impl RecordingDevice {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceTrigger for RecordingDevice {
    async fn invoke(&self, argument: &str) -> Result<String, DeviceError> {
        self.calls.lock().unwrap().push(argument.to_string());
        Ok("1".to_string())
    }
}

/// Device whose every call is rejected.
pub(crate) struct FailingDevice;

#[async_trait]
impl DeviceTrigger for FailingDevice {
    async fn invoke(&self, _argument: &str) -> Result<String, DeviceError> {
        Err(DeviceError::Status {
            status: 500,
            body: "device offline".to_string(),
        })
    }
}

/// Provider that replies from a queue, then echoes the user message.
#[derive(Default)]
pub(crate) struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub(crate) fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    /// User messages the provider has been asked about.
    pub(crate) fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    async fn complete(&self, req: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let user = req
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().unwrap().push(user.clone());

        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or(Ok(user)).map(|content| CompletionResponse {
            content,
            finish_reason: FinishReason::Stop,
            input_tokens: 0,
            output_tokens: 0,
        })
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}
