use std::{convert::Infallible, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    core::{
        db::ParticipantDb,
        scanner::ScannerRequest,
        transfer::{export_chunks, TransferChunk},
    },
    integrations::connectivity::ConnectivityStatus,
    send_message, Directory,
};

/// A Json struct carrying a scanned token
#[derive(Serialize, Deserialize, Debug)]
pub struct Scan {
    pub token: String,
}

/// A Json struct carrying one received transfer chunk
#[derive(Serialize, Deserialize, Debug)]
pub struct ImportChunk {
    pub chunk: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct EventQuery {
    pub event: String,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

/// A Json struct reporting the platform link state
#[derive(Serialize, Deserialize, Debug)]
pub struct LinkState {
    pub connected: bool,
}

#[derive(Serialize, Debug)]
pub struct SyncStatus {
    pub connectivity: ConnectivityStatus,
    pub has_synced: bool,
    pub pending: usize,
}

pub fn to_http_none_or_error(result: anyhow::Result<()>) -> Result<impl warp::Reply, Infallible> {
    match result {
        Ok(_) => Ok(warp::reply::with_status(
            "Success".to_string(),
            warp::http::StatusCode::OK,
        )),
        Err(e) => {
            log::warn!("{}", e);
            Ok(warp::reply::with_status(
                e.to_string(),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

pub fn to_http_output<T: Serialize>(
    result: anyhow::Result<T>,
) -> Result<impl warp::Reply, Infallible> {
    match result.and_then(|data| Ok(serde_json::to_string::<T>(&data)?)) {
        Ok(json) => Ok(warp::reply::with_status(json, warp::http::StatusCode::OK)),
        Err(e) => {
            log::warn!("{}", e);
            Ok(warp::reply::with_status(
                e.to_string(),
                warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            ))
        }
    }
}

pub async fn scan(
    session: u64,
    scan: Scan,
    directory: Directory,
) -> Result<impl warp::Reply, Infallible> {
    to_http_output(send_message!(
        directory.scanner_actor,
        ScannerRequest,
        Scan,
        session,
        scan.token
    ))
}

pub async fn export_snapshot(
    query: EventQuery,
    db: Arc<ParticipantDb>,
    directory: Directory,
) -> Result<impl warp::Reply, Infallible> {
    let chunks = export_chunks(
        &db,
        &query.event,
        directory.settings.transfer_max_payload(),
    )
    .await
    .and_then(|chunks| {
        chunks
            .iter()
            .map(TransferChunk::encode)
            .collect::<anyhow::Result<Vec<String>>>()
    });

    to_http_output(chunks)
}

pub async fn import_chunk(
    query: EventQuery,
    import: ImportChunk,
    directory: Directory,
) -> Result<impl warp::Reply, Infallible> {
    let progress = directory
        .assembler
        .accept_raw(&import.chunk, &query.event)
        .await
        .map_err(|e| {
            log::warn!("Rejected transfer chunk: {}", e);
            anyhow::Error::from(e)
        });
    to_http_output(progress)
}

pub async fn sync_status(
    db: Arc<ParticipantDb>,
    directory: Directory,
) -> Result<impl warp::Reply, Infallible> {
    let status = db.list_pending(None).await.map(|pending| SyncStatus {
        connectivity: directory.monitor.status(),
        has_synced: directory.monitor.has_synced(),
        pending: pending.len(),
    });
    to_http_output(status)
}
