//! D-Bus publication of per-file sync status.
//!
//! Exposes `GetFileStatus(path) -> status` and emits
//! `FileStatusChanged(path, status)` signals on the session bus. GUI
//! integrations consume this interface; the engine works the same with
//! the feature disabled.

use super::{FileStatus, StatusEvent};
use crate::ItemId;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zbus::{interface, object_server::SignalContext};

pub const BUS_NAME: &str = "org.onemount.FileStatus";
pub const OBJECT_PATH: &str = "/org/onemount/FileStatus";

/// Resolves a repository-relative path to a current status string.
pub type StatusLookup = Arc<dyn Fn(&str) -> Option<FileStatus> + Send + Sync>;
/// Resolves an item id to its path for signal emission.
pub type PathLookup = Arc<dyn Fn(&ItemId) -> Option<String> + Send + Sync>;

pub struct StatusService {
    lookup: StatusLookup,
}

#[interface(name = "org.onemount.FileStatus")]
impl StatusService {
    fn get_file_status(&self, path: &str) -> String {
        (self.lookup)(path)
            .unwrap_or(FileStatus::OutOfSync)
            .as_str()
            .to_owned()
    }

    #[zbus(signal)]
    async fn file_status_changed(
        ctx: &SignalContext<'_>,
        path: &str,
        status: &str,
    ) -> zbus::Result<()>;
}

/// Connect to the session bus, claim the well-known name and forward
/// publisher events as signals until cancelled.
pub async fn serve(
    events: flume::Receiver<StatusEvent>,
    lookup: StatusLookup,
    paths: PathLookup,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, StatusService { lookup })?
        .build()
        .await?;

    let iface = connection
        .object_server()
        .interface::<_, StatusService>(OBJECT_PATH)
        .await?;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv_async() => match event {
                Ok(event) => event,
                Err(_) => break,
            },
        };
        let path = match paths(&event.id) {
            Some(path) => path,
            None => continue,
        };
        if let Err(e) = StatusService::file_status_changed(
            iface.signal_context(),
            &path,
            event.status.as_str(),
        )
        .await
        {
            warn!(err = %e, "failed to emit FileStatusChanged");
        }
    }

    debug!("status D-Bus service stopped");
    Ok(())
}
