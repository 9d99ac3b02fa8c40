use crate::Error;
use derive_more::Display;
use kube::runtime::events::{Event, EventType, Recorder};

pub struct EventRecorder(Recorder);

impl From<Recorder> for EventRecorder {
    fn from(recorder: Recorder) -> Self {
        EventRecorder(recorder)
    }
}

impl EventRecorder {
    pub async fn info<N>(&self, action: EventAction, reason: EventReason, note: N) -> Result<(), Error>
    where
        N: Into<String>,
    {
        self.publish(EventType::Normal, action, reason, note).await
    }

    pub async fn warn<N>(&self, action: EventAction, reason: EventReason, note: N) -> Result<(), Error>
    where
        N: Into<String>,
    {
        self.publish(EventType::Warning, action, reason, note).await
    }

    pub async fn publish<N>(&self, type_: EventType, action: EventAction, reason: EventReason, note: N) -> Result<(), Error>
    where
        N: Into<String>,
    {
        Ok(self.0
            .publish(Event {
                type_,
                action: action.to_string(),
                reason: reason.to_string(),
                note: Some(note.into()),
                secondary: None,
            })
            .await?)
    }
}

#[derive(Display, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventAction {
    #[display("Apply")]
    Apply,
    #[display("Cleanup")]
    Cleanup,
    #[display("Deploy")]
    Deploy,
    #[display("Connect")]
    Connect,
    #[display("RotateTokens")]
    RotateTokens,
}

#[derive(Display, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventReason {
    #[display("Synchronized")]
    Synchronized,
    #[display("ApplyFailed")]
    ApplyFailed,
    #[display("InvalidSpec")]
    InvalidSpec,
    #[display("DeleteRequested")]
    DeleteRequested,
    #[display("CleanupFailed")]
    CleanupFailed,
    #[display("Ready")]
    Ready,
    #[display("NotReady")]
    NotReady,
    #[display("DeploymentFailed")]
    DeploymentFailed,
    #[display("TokenCreated")]
    TokenCreated,
    #[display("TokenRevoked")]
    TokenRevoked,
}
