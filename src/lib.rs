pub mod auth;
pub mod backoff;
pub mod config;
pub mod detect;
pub mod engine;
pub mod err;
pub mod events;
pub mod grades;
pub mod locks;
pub mod models;
pub mod parse;
pub mod policy;
pub mod portal;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod vault;

use std::sync::Arc;

use axum::handler::Handler;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Serialize;

use crate::engine::Engine;

pub use crate::err::Error;
use crate::err::{Fine, Maybe, Nothing};

pub type Payload<T> = axum::response::Result<Json<Maybe<T>>, Error>;

pub fn proceeds<V>(value: V) -> Payload<V>
where
    V: Serialize,
{
    Ok(Json(Fine(value)))
}

pub fn breaks<V>(err: Error) -> Payload<V>
where
    V: Serialize,
{
    Ok(Json(Nothing(err)))
}

/// JSON control surface over the engine.
pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/subjects", post(auth::register_subject))
        .route(
            "/subjects/:id",
            get(auth::read_subject).delete(auth::delete_subject),
        )
        .route("/subjects/:id/:kind/refresh", post(grades::refresh))
        .route("/subjects/:id/:kind/snapshot", get(grades::snapshot))
        .route(
            "/subjects/:id/:kind/monitoring",
            get(grades::monitoring).put(grades::set_monitoring),
        )
        .fallback(err::handler404.into_service())
        .layer(Extension(engine))
}
