use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::HeaderValue;
use axum::http::StatusCode;
use axum::http::header;
use axum::response::Json;
use axum::response::Response;
use axum::routing::{delete, get, post};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use mangashelf::error::DownloadError;
use mangashelf::notify::email::{DisabledEmailChannel, SmtpConfig, SmtpEmailChannel};
use mangashelf::notify::push::{DisabledPushChannel, VapidConfig, WebPushChannel};
use mangashelf::notify::registry::{PushSubscription, SubscriberRegistry};
use mangashelf::notify::{EmailChannel, NotificationEvent, Notifier, PushChannel};
use mangashelf::pipeline::Pipeline;
use mangashelf::scheduler::DiscoveryScheduler;
use mangashelf::source::{CachedListing, HttpSourceClient, SourceClient};
use mangashelf::store::ArtifactStore;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct AppArgs {
    #[arg(long, default_value = "127.0.0.1:8001")]
    addr: SocketAddr,

    /// Root directory for downloaded chapter artifacts.
    #[arg(long, default_value = "chapters")]
    artifact_root: PathBuf,

    #[arg(long, default_value = "https://onepiece.tube")]
    source_base_url: String,

    /// External base URL used in notification download links.
    #[arg(long)]
    public_base_url: Option<String>,

    /// Seconds between automatic discovery passes. 0 disables the timer.
    #[arg(long, default_value_t = 1800)]
    poll_interval_secs: u64,

    /// Concurrent chapter downloads per discovery pass.
    #[arg(long, default_value_t = 2)]
    download_parallelism: usize,

    #[arg(long, default_value_t = 10)]
    delivery_timeout_secs: u64,

    /// How long the remote listing is served from cache.
    #[arg(long, default_value_t = 60)]
    listing_cache_secs: u64,
}

#[derive(Clone)]
struct AppState {
    source: Arc<dyn SourceClient>,
    listing: Arc<CachedListing>,
    store: Arc<ArtifactStore>,
    pipeline: Arc<Pipeline>,
    scheduler: Arc<DiscoveryScheduler>,
    notifier: Arc<Notifier>,
    push_public_key: Option<String>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    mangashelf::logging::init()?;

    let args = AppArgs::parse();
    tracing::info!(?args, "starting mangashelf-app");

    let source: Arc<dyn SourceClient> = Arc::new(HttpSourceClient::new(&args.source_base_url)?);
    let store = Arc::new(ArtifactStore::open(&args.artifact_root).await?);
    let registry = Arc::new(SubscriberRegistry::new());

    let email: Arc<dyn EmailChannel> = match SmtpConfig::from_env()? {
        Some(config) => {
            tracing::info!(host = %config.host, "email notifications enabled");
            Arc::new(SmtpEmailChannel::new(&config)?)
        }
        None => {
            tracing::info!("MANGASHELF_SMTP_HOST not set; email notifications disabled");
            Arc::new(DisabledEmailChannel)
        }
    };
    let (push, push_public_key): (Arc<dyn PushChannel>, Option<String>) =
        match VapidConfig::from_env()? {
            Some(config) => {
                let channel = WebPushChannel::new(config);
                let key = channel.public_key().to_string();
                tracing::info!("web push notifications enabled");
                (Arc::new(channel), Some(key))
            }
            None => {
                tracing::info!("MANGASHELF_VAPID_PRIVATE_KEY not set; web push disabled");
                (Arc::new(DisabledPushChannel), None)
            }
        };

    let notifier = Arc::new(Notifier::new(
        Arc::clone(&registry),
        email,
        push,
        Duration::from_secs(args.delivery_timeout_secs),
    ));

    let public_base_url = args
        .public_base_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", args.addr));
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&source),
        Arc::clone(&store),
        Arc::clone(&notifier),
        public_base_url,
    ));
    let scheduler = Arc::new(DiscoveryScheduler::new(
        Arc::clone(&source),
        Arc::clone(&store),
        Arc::clone(&pipeline),
        args.download_parallelism,
    ));
    if args.poll_interval_secs > 0 {
        scheduler.spawn_interval(Duration::from_secs(args.poll_interval_secs));
    }

    let state = AppState {
        source,
        listing: Arc::new(CachedListing::new(Duration::from_secs(
            args.listing_cache_secs,
        ))),
        store,
        pipeline,
        scheduler,
        notifier,
        push_public_key,
    };

    let app = Router::new()
        .route(
            "/health",
            get(|| async { Json(json!({ "status": "healthy", "service": "mangashelf" })) }),
        )
        .route("/api/chapters/available", get(available_chapters))
        .route("/api/latest", get(latest_chapter))
        .route("/api/chapters", get(list_downloaded))
        .route("/api/chapters/:number", post(download_chapter))
        .route("/api/chapters/:number", delete(delete_chapter))
        .route("/api/chapters/:number/epub", get(download_epub))
        .route("/api/subscribe/email", post(subscribe_email))
        .route("/api/push/subscribe", post(subscribe_push))
        .route("/api/push/unsubscribe", post(unsubscribe_push))
        .route("/api/push/vapid-public-key", get(vapid_public_key))
        .route("/api/notify/test/:subscriber_id", post(notify_test))
        .route("/api/scheduler/trigger", post(trigger_scheduler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.addr)
        .await
        .map_err(|err| anyhow::anyhow!("bind {}: {err}", args.addr))?;
    tracing::info!(addr = %args.addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
            }
        })
        .await?;
    Ok(())
}

fn download_error_response(err: DownloadError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &err {
        DownloadError::ChapterNotAvailable(_) => StatusCode::NOT_FOUND,
        DownloadError::IncompletePageSet { .. }
        | DownloadError::SourceUnavailable(_)
        | DownloadError::Parse(_) => StatusCode::BAD_GATEWAY,
        DownloadError::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
        DownloadError::AssemblyFailure(_) | DownloadError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() })))
}

async fn available_chapters(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let chapters = state
        .listing
        .get(&*state.source)
        .await
        .map_err(|err| download_error_response(err.into()))?;
    let mut out = Vec::with_capacity(chapters.len());
    for chapter in chapters {
        let downloaded = state.store.contains(chapter.number).await;
        out.push(json!({
            "number": chapter.number,
            "title": chapter.title,
            "published_date": chapter.published_date,
            "page_count": chapter.page_count,
            "available": chapter.available,
            "downloaded": downloaded,
        }));
    }
    Ok(Json(json!({ "chapters": out })))
}

async fn latest_chapter(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let latest = state
        .source
        .fetch_latest_chapter_number()
        .await
        .map_err(|err| download_error_response(err.into()))?;
    let downloaded = state.store.contains(latest).await;
    Ok(Json(json!({ "latest": latest, "downloaded": downloaded })))
}

async fn list_downloaded(State(state): State<AppState>) -> Json<serde_json::Value> {
    let chapters = state.store.list().await;
    Json(json!({ "chapters": chapters }))
}

async fn download_chapter(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let record = state
        .pipeline
        .download_chapter(number)
        .await
        .map_err(download_error_response)?;
    Ok(Json(serde_json::to_value(&record).unwrap_or_default()))
}

async fn delete_chapter(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> Result<StatusCode, (StatusCode, Json<serde_json::Value>)> {
    match state.store.remove(number).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("chapter {number} is not downloaded") })),
        )),
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{err:#}") })),
        )),
    }
}

async fn download_epub(
    State(state): State<AppState>,
    Path(number): Path<u32>,
) -> Result<Response, StatusCode> {
    let Some(record) = state.store.get(number).await else {
        return Err(StatusCode::NOT_FOUND);
    };

    let file = tokio::fs::File::open(&record.artifact_path)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let stream = ReaderStream::new(file);
    let body = axum::body::Body::from_stream(stream);

    let mut resp = Response::new(body);
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/epub+zip"),
    );
    resp.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&format!("attachment; filename=\"chapter-{number}.epub\""))
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?,
    );
    Ok(resp)
}

#[derive(Debug, Deserialize)]
struct EmailSubscribeRequest {
    email: String,
}

async fn subscribe_email(
    State(state): State<AppState>,
    Json(req): Json<EmailSubscribeRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let address = req.email.trim();
    if address.is_empty() || !address.contains('@') {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "a valid email address is required" })),
        ));
    }
    let id = state.notifier.registry().subscribe_email(address).await;
    Ok(Json(json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
struct PushSubscribeRequest {
    endpoint: String,
    keys: PushKeys,
}

#[derive(Debug, Deserialize)]
struct PushKeys {
    p256dh: String,
    auth: String,
}

async fn subscribe_push(
    State(state): State<AppState>,
    Json(req): Json<PushSubscribeRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if req.endpoint.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "endpoint is required" })),
        ));
    }
    // Browsers hand out the key material as url-safe base64; reject
    // subscriptions that could never be encrypted to.
    let key_engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    for (name, value) in [("keys.p256dh", &req.keys.p256dh), ("keys.auth", &req.keys.auth)] {
        if base64::Engine::decode(&key_engine, value.trim_end_matches('=')).is_err() {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("{name} is not valid base64url") })),
            ));
        }
    }
    let id = state
        .notifier
        .registry()
        .subscribe_push(PushSubscription {
            endpoint: req.endpoint.trim().to_string(),
            p256dh: req.keys.p256dh,
            auth: req.keys.auth,
        })
        .await;
    Ok(Json(json!({ "id": id })))
}

#[derive(Debug, Deserialize)]
struct PushUnsubscribeRequest {
    endpoint: String,
}

async fn unsubscribe_push(
    State(state): State<AppState>,
    Json(req): Json<PushUnsubscribeRequest>,
) -> Json<serde_json::Value> {
    let removed = state
        .notifier
        .registry()
        .unsubscribe_push(req.endpoint.trim())
        .await;
    Json(json!({ "removed": removed }))
}

async fn vapid_public_key(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match &state.push_public_key {
        Some(key) => Ok(Json(json!({ "public_key": key }))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn notify_test(
    State(state): State<AppState>,
    Path(subscriber_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let event = NotificationEvent {
        chapter_number: 0,
        title: "Testbenachrichtigung".to_string(),
        url: String::new(),
    };
    match state.notifier.notify_one(subscriber_id, &event).await {
        Some(report) => Ok(Json(serde_json::to_value(&report).unwrap_or_default())),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "unknown subscriber" })),
        )),
    }
}

async fn trigger_scheduler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let started = state.scheduler.trigger();
    Json(json!({ "started": started, "queued": !started }))
}
