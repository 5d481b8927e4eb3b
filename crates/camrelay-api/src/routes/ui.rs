//! Demo page: a viewer and an optional publisher in one page.

use axum::{
    Router,
    http::header,
    response::{Html, IntoResponse},
    routing::get,
};
use std::sync::Arc;

use crate::AppState;

const INDEX_HTML: &str = include_str!("../../static/index.html");
const APP_JS: &str = include_str!("../../static/app.js");

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(index))
        .route("/app.js", get(app_js))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn app_js() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "application/javascript")], APP_JS)
}
