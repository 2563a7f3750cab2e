use std::{convert::Infallible, sync::Arc};

use warp::{reject::Rejection, Filter};

use crate::{
    core::{
        db::ParticipantDb,
        registration::RegistrationRequest,
        scanner::{OpenSession, ScannerRequest},
    },
    send_message, Directory,
};

use super::handlers::{
    export_snapshot, import_chunk, scan, sync_status, to_http_none_or_error, to_http_output,
    EventQuery, LinkState, SearchQuery,
};

pub fn with_db(
    db: Arc<ParticipantDb>,
) -> impl Filter<Extract = (Arc<ParticipantDb>,), Error = Infallible> + Clone {
    warp::any().map(move || db.clone())
}

pub fn with_directory(
    directory: Directory,
) -> impl Filter<Extract = (Directory,), Error = Infallible> + Clone {
    warp::any().map(move || directory.clone())
}

fn session_filters(
    directory: Directory,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    let open_session = warp::path!("session")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_directory(directory.clone()))
        .and_then(async |open: OpenSession, directory: Directory| {
            to_http_output(send_message!(
                directory.scanner_actor,
                ScannerRequest,
                Open,
                open
            ))
        });

    let get_session = warp::path!("session" / u64)
        .and(warp::get())
        .and(with_directory(directory.clone()))
        .and_then(async |id: u64, directory: Directory| {
            to_http_output(send_message!(directory.scanner_actor, ScannerRequest, Get, id))
        });

    let close_session = warp::path!("session" / u64)
        .and(warp::delete())
        .and(with_directory(directory.clone()))
        .and_then(async |id: u64, directory: Directory| {
            to_http_output(send_message!(
                directory.scanner_actor,
                ScannerRequest,
                Close,
                id
            ))
        });

    let scan_token = warp::path!("session" / u64 / "scan")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_directory(directory.clone()))
        .and_then(scan);

    let confirm = warp::path!("session" / u64 / "confirm")
        .and(warp::post())
        .and(with_directory(directory.clone()))
        .and_then(async |id: u64, directory: Directory| {
            to_http_output(send_message!(
                directory.scanner_actor,
                ScannerRequest,
                Confirm,
                id
            ))
        });

    let cancel = warp::path!("session" / u64 / "cancel")
        .and(warp::post())
        .and(with_directory(directory.clone()))
        .and_then(async |id: u64, directory: Directory| {
            to_http_none_or_error(send_message!(
                directory.scanner_actor,
                ScannerRequest,
                Cancel,
                id
            ))
        });

    let register = warp::path!("session" / u64 / "register")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_directory(directory))
        .and_then(
            async |id: u64, req: RegistrationRequest, directory: Directory| {
                to_http_output(send_message!(
                    directory.scanner_actor,
                    ScannerRequest,
                    Register,
                    id,
                    req
                ))
            },
        );

    open_session
        .or(get_session)
        .or(close_session)
        .or(scan_token)
        .or(confirm)
        .or(cancel)
        .or(register)
}

fn sync_filters(
    db: Arc<ParticipantDb>,
    directory: Directory,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    let trigger_sync = warp::path!("sync")
        .and(warp::post())
        .and(with_directory(directory.clone()))
        .and_then(async |directory: Directory| {
            to_http_output(directory.sync_engine.sync_now().await)
        });

    let status = warp::path!("sync" / "status")
        .and(warp::get())
        .and(with_db(db))
        .and(with_directory(directory.clone()))
        .and_then(sync_status);

    let foreground = warp::path!("connectivity" / "foreground")
        .and(warp::post())
        .and(with_directory(directory.clone()))
        .and_then(async |directory: Directory| {
            directory.monitor.foreground();
            to_http_none_or_error(Ok(()))
        });

    let link = warp::path!("connectivity" / "link")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_directory(directory.clone()))
        .and_then(async |link: LinkState, directory: Directory| {
            directory.monitor.link_changed(link.connected);
            to_http_none_or_error(Ok(()))
        });

    let reset = warp::path!("connectivity" / "reset")
        .and(warp::post())
        .and(with_directory(directory))
        .and_then(async |directory: Directory| {
            directory.monitor.reset();
            to_http_none_or_error(Ok(()))
        });

    trigger_sync.or(status).or(foreground).or(link).or(reset)
}

fn transfer_filters(
    db: Arc<ParticipantDb>,
    directory: Directory,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    let export = warp::path!("export")
        .and(warp::get())
        .and(warp::query::<EventQuery>())
        .and(with_db(db.clone()))
        .and(with_directory(directory.clone()))
        .and_then(export_snapshot);

    let import = warp::path!("import")
        .and(warp::post())
        .and(warp::query::<EventQuery>())
        .and(warp::body::json())
        .and(with_directory(directory.clone()))
        .and_then(import_chunk);

    let backup = warp::path!("backup")
        .and(warp::post())
        .and(with_db(db))
        .and(with_directory(directory))
        .and_then(async |db: Arc<ParticipantDb>, directory: Directory| {
            to_http_output(directory.backup.append_admitted(&db).await)
        });

    export.or(import).or(backup)
}

pub fn api_filters(
    db: Arc<ParticipantDb>,
    directory: Directory,
) -> impl Filter<Extract = (impl warp::Reply,), Error = Rejection> + Clone {
    let search = warp::path!("participants")
        .and(warp::get())
        .and(warp::query::<SearchQuery>())
        .and(with_db(db.clone()))
        .and_then(async |query: SearchQuery, db: Arc<ParticipantDb>| {
            to_http_output(db.search(&query.q).await)
        });

    let stats = warp::path!("stats")
        .and(warp::get())
        .and(warp::query::<EventQuery>())
        .and(with_db(db.clone()))
        .and_then(async |query: EventQuery, db: Arc<ParticipantDb>| {
            to_http_output(db.event_counts(&query.event).await)
        });

    search
        .or(stats)
        .or(session_filters(directory.clone()))
        .or(sync_filters(db.clone(), directory.clone()))
        .or(transfer_filters(db, directory))
}
