use crate::core::VaultKey;
use crate::jobs::RetentionReport;
use crate::session::SessionHandle;
use tokio::sync::mpsc;

/// Notifications delivered to the simulation loop.
#[derive(Debug)]
pub enum VaultEvent {
    OpenSucceeded {
        session: SessionHandle,
    },
    OpenRejected {
        owner_id: String,
        index: u32,
        reason: String,
    },
    SaveCompleted {
        key: VaultKey,
    },
    SaveFailed {
        key: VaultKey,
        cause: String,
    },
    Deleted {
        key: VaultKey,
    },
    MigrationProgress {
        done: usize,
        total: usize,
    },
    RetentionReport(RetentionReport),
}

/// Receiving side of the manager's event channel.
pub struct VaultEvents {
    rx: mpsc::UnboundedReceiver<VaultEvent>,
}

impl VaultEvents {
    pub(crate) fn channel() -> (mpsc::UnboundedSender<VaultEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Everything queued so far, without waiting. Meant to be called once per tick.
    pub fn drain(&mut self) -> Vec<VaultEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn recv(&mut self) -> Option<VaultEvent> {
        self.rx.recv().await
    }
}
