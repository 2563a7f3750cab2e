use std::sync::Arc;

use tokio::task::JoinSet;

use crate::core::{settings::Settings, sync::SyncEngine};

use self::{
    connectivity::{start_monitor, HttpProbe, MonitorHandle},
    remote::{HttpRemoteStore, MemoryRemoteStore, RemoteStore},
};

pub mod connectivity;
pub mod remote;

/// Builds the remote document store named in the settings.
///
/// Without a remote url the device runs fully offline and every sync attempt
/// fails until one is configured.
pub fn remote_from_settings(settings: &Settings) -> anyhow::Result<Arc<dyn RemoteStore>> {
    match &settings.remote_url {
        Some(url) => Ok(Arc::new(HttpRemoteStore::new(
            url,
            settings.remote_token.clone(),
            settings.remote_timeout(),
        )?)),
        None => {
            log::warn!("No remote_url configured, running without a remote store");
            Ok(Arc::new(MemoryRemoteStore::offline()))
        }
    }
}

pub fn init_integrations(
    tasks: &mut JoinSet<Result<(), anyhow::Error>>,
    settings: Arc<Settings>,
    sync: Arc<SyncEngine>,
) -> anyhow::Result<MonitorHandle> {
    let probe = Arc::new(HttpProbe::new(
        &settings.probe_url(),
        settings.probe_timeout(),
    )?);

    let (monitor, task) = start_monitor(probe, sync.clone(), settings.poll_interval());
    tasks.spawn(async move { task.await? });

    let mut events = sync.subscribe();
    tasks.spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log::debug!("Sync: {:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("Sync log skipped {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        Ok(())
    });

    Ok(monitor)
}
