use axum::extract::{Form, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use std::{net::SocketAddr, sync::Arc};

use crate::app::{run_discussion, RunContext};
use crate::models::LanguageModel;
use crate::report::{render_index, render_session};
use crate::session::{Session, SessionSummary};
use crate::settings::Settings;
use crate::stats::{self, OverallStats, SessionStats};
use crate::storage::{JsonLogStore, SessionStore};

#[derive(Clone)]
pub struct AppState {
    pub model: Arc<dyn LanguageModel>,
    pub store: Arc<JsonLogStore>,
    pub settings: Arc<Settings>,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Deserialize)]
pub struct StartForm {
    pub topic: String,
}

struct AppError(StatusCode, String);

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{err:#}"), "request failed");
        AppError(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
    }
}

async fn index(State(state): State<AppState>) -> Result<Html<String>, AppError> {
    let sessions = state.store.list().await?;
    Ok(Html(render_index(&sessions)))
}

async fn start_session(State(state): State<AppState>, Form(form): Form<StartForm>) -> Result<Redirect, AppError> {
    if form.topic.trim().is_empty() {
        return Err(AppError(StatusCode::BAD_REQUEST, "topic must not be empty".into()));
    }
    let ctx = RunContext { store: state.store.as_ref(), model: state.model.as_ref(), settings: state.settings.as_ref() };
    let saved = run_discussion(ctx, &form.topic, |_| {}).await.map_err(|err| {
        tracing::error!(error = %format!("{err:#}"), "discussion failed");
        AppError(StatusCode::BAD_GATEWAY, format!("{err:#}"))
    })?;
    Ok(Redirect::to(&format!("/sessions/{}", saved.session.id)))
}

async fn find_session(state: &AppState, id: &str) -> Result<Session, AppError> {
    match state.store.load(id).await {
        Ok(Some(s)) => Ok(s),
        Ok(None) => Err(AppError(StatusCode::NOT_FOUND, format!("no session {id}"))),
        Err(err) => Err(AppError(StatusCode::BAD_REQUEST, format!("{err:#}"))),
    }
}

async fn show_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<Html<String>, AppError> {
    let session = find_session(&state, &id).await?;
    Ok(Html(render_session(&session)))
}

async fn list_sessions_json(State(state): State<AppState>) -> Result<Json<Vec<SessionSummary>>, AppError> {
    Ok(Json(state.store.list().await?))
}

async fn get_session_json(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Session>, AppError> {
    Ok(Json(find_session(&state, &id).await?))
}

async fn session_stats_json(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<SessionStats>, AppError> {
    Ok(Json(stats::analyze(&find_session(&state, &id).await?)))
}

async fn overall_stats_json(State(state): State<AppState>) -> Result<Json<OverallStats>, AppError> {
    let sessions = state.store.load_all().await?;
    Ok(Json(stats::summarize(&sessions)))
}

async fn metrics_text(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], handle.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/sessions", axum::routing::post(start_session))
        .route("/sessions/:id", get(show_session))
        .route("/api/sessions", get(list_sessions_json))
        .route("/api/sessions/:id", get(get_session_json))
        .route("/api/sessions/:id/stats", get(session_stats_json))
        .route("/api/stats", get(overall_stats_json))
        .route("/metrics", get(metrics_text))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "web ui listening");
    println!("Web UI: http://{}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::test_support::FakeEndpoint;
    use crate::models::OpenAICompatible;
    use crate::settings::{resolve_settings, EnvDefaults, Overrides};
    use tempfile::tempdir;

    async fn spawn_app(log_dir: &std::path::Path) -> String {
        let base = FakeEndpoint::with_contents(&["s", "v", "j. This concludes the discussion."]).spawn().await;
        let env = EnvDefaults { base_url: Some(base), ..Default::default() };
        let settings = resolve_settings(&env, &Overrides { local: true, log_dir: Some(log_dir.to_path_buf()), ..Default::default() }).unwrap();
        let model = OpenAICompatible::from_settings(&settings).unwrap();
        let state = AppState {
            model: Arc::new(model),
            store: Arc::new(JsonLogStore::new(&settings.log_dir)),
            settings: Arc::new(settings),
            metrics: None,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn form_post_runs_discussion_and_renders_it() {
        let dir = tempdir().unwrap();
        let app = spawn_app(dir.path()).await;
        let client = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none()).build().unwrap();

        let resp = client.post(format!("{app}/sessions")).form(&[("topic", "urban gardens")]).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::SEE_OTHER);
        let location = resp.headers()[reqwest::header::LOCATION].to_str().unwrap().to_string();
        assert!(location.starts_with("/sessions/"));

        let html = client.get(format!("{app}{location}")).send().await.unwrap().text().await.unwrap();
        assert!(html.contains("urban gardens"));
        assert!(html.contains("class=\"turn judge\""));

        let list: Vec<SessionSummary> = client.get(format!("{app}/api/sessions")).send().await.unwrap().json().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].turns, 3);

        let id = location.trim_start_matches("/sessions/");
        let session: Session = client.get(format!("{app}/api/sessions/{id}")).send().await.unwrap().json().await.unwrap();
        assert_eq!(session.topic, "urban gardens");

        let one: SessionStats = client.get(format!("{app}/api/sessions/{id}/stats")).send().await.unwrap().json().await.unwrap();
        assert_eq!(one.turns_per_round, vec![3]);
        let all: serde_json::Value = client.get(format!("{app}/api/stats")).send().await.unwrap().json().await.unwrap();
        assert_eq!(all["sessions"], 1);
        assert_eq!(all["concluded"], 1);

        let index = client.get(&app).send().await.unwrap().text().await.unwrap();
        assert!(index.contains(&format!("/sessions/{id}")));
    }

    #[tokio::test]
    async fn unknown_and_invalid_ids_and_blank_topics() {
        let dir = tempdir().unwrap();
        let app = spawn_app(dir.path()).await;
        let client = reqwest::Client::new();

        let missing = client.get(format!("{app}/sessions/20260101_000000_abcdef")).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
        let bad = client.get(format!("{app}/api/sessions/bad.id")).send().await.unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::BAD_REQUEST);
        let blank = client.post(format!("{app}/sessions")).form(&[("topic", "  ")]).send().await.unwrap();
        assert_eq!(blank.status(), reqwest::StatusCode::BAD_REQUEST);
        let metrics = client.get(format!("{app}/metrics")).send().await.unwrap();
        assert_eq!(metrics.status(), reqwest::StatusCode::NOT_FOUND);
    }
}
