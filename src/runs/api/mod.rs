pub mod routes;
pub mod sse;

use axum::Router;

use crate::runs::runtime::RunController;

/// Request/response run routes. These are the routes the request timeout
/// applies to.
pub fn router() -> Router<RunController> {
    routes::build_router()
}

/// Long-lived SSE routes, mounted outside the request timeout.
pub fn stream_router() -> Router<RunController> {
    sse::build_router()
}
