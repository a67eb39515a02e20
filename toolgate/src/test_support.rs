//! Shared fixtures for in-crate tests.

use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use crate::notify::{EventSink, SinkResult};

/// Records every delivered event; configurable to stall, decline, or fail.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub events: Mutex<Vec<(String, Value)>>,
    pub decline: bool,
    pub fail: bool,
    pub stall: bool,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send_event(&self, event_type: &str, data: Value) -> SinkResult {
        if self.stall {
            tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
        }
        if self.fail {
            return Err("websocket connection reset".into());
        }
        if self.decline {
            return Ok(false);
        }
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((event_type.to_owned(), data));
        Ok(true)
    }
}
