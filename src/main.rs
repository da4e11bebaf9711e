mod db_types;
mod dialogue;
mod error;
mod handlers;
mod openai_types;
mod speech;
mod types;

use crate::types::{AppState, SessionStore};

use axum::{
    routing::{get, post, put},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::env;
use std::sync::Arc;
use tracing_subscriber::prelude::*;

pub mod consts {
    pub const CHAT_MODEL: &str = "gpt-3.5-turbo";
    pub const STT_MODEL: &str = "whisper-1";
    pub const TTS_MODEL: &str = "tts-1";
    pub const CHAT_MAX_TOKENS: u32 = 200;
    pub const CHAT_TEMPERATURE: f32 = 0.7;
    pub const DEFAULT_VOICE: &str = "alloy";
    pub const AVAILABLE_VOICES: &[&str] = &["alloy", "echo", "fable", "onyx", "nova", "shimmer"];
    pub const APPOINTMENT_KEYWORDS: &[&str] = &[
        "appointment",
        "schedule",
        "book",
        "meeting",
        "visit",
        "see the doctor",
        "consultation",
        "available",
    ];
    pub const FALLBACK_REPLY: &str = "I apologize, but I'm having trouble processing your \
                                      request right now. Could you please repeat that?";
    /// Business config keys templated into the system prompt.
    pub const PROMPT_CONFIG_KEYS: &[&str] = &[
        "business_name",
        "business_hours",
        "business_address",
        "business_phone",
        "business_email",
        "services",
    ];
    /// Business config key that overrides the OPENAI_API_KEY environment variable.
    pub const API_KEY_CONFIG_KEY: &str = "openai_api_key";
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let subscriber = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_file(true)
                .with_line_number(true),
        )
        .with(tracing_subscriber::filter::Targets::new().with_targets([
            ("hyper", tracing_subscriber::filter::LevelFilter::OFF),
            (
                "receptionist_rs",
                tracing_subscriber::filter::LevelFilter::DEBUG,
            ),
        ]));
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let database_url = env::var("DATABASE_URL").expect("DATABASE_URL not set!");
    // May be absent when the key lives in business config instead.
    let openai_api_key = env::var("OPENAI_API_KEY").ok();
    if openai_api_key.is_none() {
        tracing::warn!("OPENAI_API_KEY not set; relying on stored business config");
    }

    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres");
    sqlx::migrate!()
        .run(&db_pool)
        .await
        .expect("failed to run migrations");

    let http_client = reqwest::Client::new();
    let sessions = SessionStore::new();

    let app_state = Arc::new(AppState {
        openai_api_key,
        http_client,
        db_pool,
        sessions,
    });

    let app = Router::new()
        .route("/process-call", post(handlers::process_call))
        .route("/text-chat", post(handlers::text_chat))
        .route("/speech-to-text", post(handlers::speech_to_text))
        .route("/text-to-speech", post(handlers::text_to_speech))
        .route("/voices", get(handlers::get_voices))
        .route("/session/:id", get(handlers::get_session_info))
        .route("/session/:id/end", post(handlers::end_session))
        .route("/calls", get(handlers::get_calls))
        .route("/calls/:id", get(handlers::get_call))
        .route(
            "/appointments",
            get(handlers::get_appointments).post(handlers::create_appointment),
        )
        .route("/appointments/:id", put(handlers::update_appointment))
        .route(
            "/config",
            get(handlers::get_business_config).post(handlers::update_business_config),
        )
        .with_state(app_state);

    axum::Server::bind(&"0.0.0.0:3000".parse().unwrap())
        .serve(app.into_make_service())
        .await
        .unwrap();
}
