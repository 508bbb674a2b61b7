use std::net::SocketAddr;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod chat;
mod error;
mod extract;
mod model;
mod routes;
mod state;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Parley API",
        version = "0.1.0",
        description = "Streaming chat turns with per-request tool-server orchestration."
    ),
    paths(
        routes::health::health_check,
        routes::models::list_models,
        routes::chats::list_chats,
        routes::chats::get_chat,
        routes::chats::delete_chat,
        routes::turns::run_chat_turn,
    ),
    components(schemas(
        routes::health::HealthResponse,
        routes::models::ModelCatalogResponse,
        routes::turns::TurnRequest,
        chat::events::TurnEvent,
        model::ModelInfo,
        parley_core::error::ApiError,
        parley_core::chat::ChatSession,
        parley_core::chat::ConversationMessage,
        parley_core::chat::MessagePart,
        parley_core::chat::Role,
        parley_mcp::ServerDescriptor,
        parley_mcp::TransportKind,
        parley_mcp::KeyValuePair,
    ))
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_api=debug,parley_mcp=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // Database connection
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!("../migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let app_state = state::AppState {
        db: pool,
        models: Arc::new(model::ProviderRegistry::from_env()),
        turn: state::TurnSettings::from_env(),
    };

    // Browser clients send owner/model/session hints as custom headers.
    let cors_layer = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::models::router())
        .merge(routes::chats::router())
        .merge(routes::turns::router())
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(cors_layer),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(3000);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Parley API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app).await.unwrap();
}
