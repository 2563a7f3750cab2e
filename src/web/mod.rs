use std::{convert::Infallible, sync::Arc};

use filters::api_filters;
use warp::{http::Method, reject::Rejection, Filter};

use crate::{core::db::ParticipantDb, Directory};

pub mod filters;
pub mod handlers;

async fn handle_rejection(err: Rejection) -> Result<impl warp::Reply, Infallible> {
    let (code, msg) = if err.is_not_found() {
        (warp::http::StatusCode::NOT_FOUND, "Not Found".to_string())
    } else if let Some(err) = err.find::<warp::filters::body::BodyDeserializeError>() {
        log::error!("{}", err);
        (warp::http::StatusCode::BAD_REQUEST, err.to_string())
    } else if let Some(err) = err.find::<warp::reject::MethodNotAllowed>() {
        log::error!("Method Not Allowed: {}", err);
        (warp::http::StatusCode::METHOD_NOT_ALLOWED, err.to_string())
    } else if let Some(err) = err.find::<warp::reject::InvalidQuery>() {
        log::error!("Invalid Query: {}", err);
        (warp::http::StatusCode::BAD_REQUEST, err.to_string())
    } else {
        log::error!("Unhandled Rejection: {:?}", err);
        (
            warp::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Internal Server Error".to_string(),
        )
    };

    Ok(warp::reply::with_status(warp::reply::json(&msg), code))
}

/// Serves the check-in API used by the scanning UI.
pub async fn run_http_server(
    db: Arc<ParticipantDb>,
    directory: Directory,
    port: u16,
) -> anyhow::Result<()> {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec![
            "User-Agent",
            "Sec-Fetch-Mode",
            "Referer",
            "Origin",
            "Content-Type",
            "Access-Control-Allow-Origin",
            "Access-Control-Request-Method",
            "Access-Control-Request-Headers",
            "Access-Control-Allow-Headers",
        ])
        .allow_methods(&[Method::GET, Method::POST, Method::DELETE, Method::OPTIONS]);

    let routes = api_filters(db, directory).recover(handle_rejection);

    log::info!("Check-in API listening on port {}", port);
    warp::serve(routes.with(cors))
        .run(([0, 0, 0, 0], port))
        .await;

    Ok(())
}
