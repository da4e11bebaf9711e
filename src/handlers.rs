use crate::db_types::{Appointment, Call};
use crate::dialogue::{self, AppointmentDetails};
use crate::error::ApiError;
use crate::speech;
use crate::types::AppState;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, error};
use uuid::Uuid;

/// An uploaded audio file parked in scoped temporary storage, plus the other
/// form fields.  Dropping this removes the file, so cleanup happens on every
/// exit path of a handler.
struct AudioUpload {
    temp: NamedTempFile,
    fields: HashMap<String, String>,
}

async fn read_audio_upload(mut multipart: Multipart) -> Result<AudioUpload, ApiError> {
    let mut temp: Option<NamedTempFile> = None;
    let mut fields = HashMap::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "audio" {
            if field.file_name().unwrap_or_default().is_empty() {
                return Err(ApiError::BadRequest("no audio file selected".to_string()));
            }
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read audio field: {e}")))?;
            let file = NamedTempFile::new().map_err(|e| {
                error!(error=%e, "failed to create temp file");
                ApiError::Internal("temporary storage unavailable".to_string())
            })?;
            tokio::fs::write(file.path(), &bytes).await.map_err(|e| {
                error!(error=%e, "failed to write uploaded audio");
                ApiError::Internal("temporary storage unavailable".to_string())
            })?;
            temp = Some(file);
        } else {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(format!("failed to read form field: {e}")))?;
            fields.insert(name, value);
        }
    }
    let temp = temp.ok_or_else(|| ApiError::BadRequest("no audio file provided".to_string()))?;
    Ok(AudioUpload { temp, fields })
}

fn parse_optional_session(raw: Option<&String>) -> Result<Option<Uuid>, ApiError> {
    match raw.map(String::as_str) {
        None | Some("") => Ok(None),
        Some(s) => Uuid::parse_str(s)
            .map(Some)
            .map_err(|_| ApiError::BadRequest("invalid session_id".to_string())),
    }
}

fn audio_headers(session_id: Option<Uuid>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, "audio/wav".parse().unwrap());
    if let Some(id) = session_id {
        headers.insert("x-session-id", id.to_string().parse().unwrap());
    }
    headers
}

/// Full voice round trip: audio in, transcribe, one dialogue turn, synthesize,
/// audio out.  The session id for the call comes back in the `x-session-id`
/// header.
pub async fn process_call(
    State(app_state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let upload = read_audio_upload(multipart).await?;
    let session_id = parse_optional_session(upload.fields.get("session_id"))?;
    let caller_phone = upload.fields.get("caller_phone").cloned();

    let user_text = speech::speech_to_text(&app_state, upload.temp.path(), None)
        .await
        .ok_or_else(|| ApiError::Internal("could not transcribe audio".to_string()))?;
    // The uploaded file has served its purpose; remove it before the vendor round trips.
    drop(upload);
    debug!(transcript=%user_text, "transcribed caller audio");

    let outcome =
        dialogue::process_message(&app_state, session_id, caller_phone.as_deref(), &user_text)
            .await?;
    let audio = speech::text_to_speech(&app_state, outcome.reply.text(), None)
        .await
        .ok_or_else(|| ApiError::Internal("could not synthesize response audio".to_string()))?;

    Ok((audio_headers(Some(outcome.session_id)), audio))
}

#[derive(Deserialize)]
pub struct TextChatRequest {
    message: Option<String>,
    session_id: Option<Uuid>,
    caller_phone: Option<String>,
}

pub async fn text_chat(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<TextChatRequest>,
) -> Result<Json<Value>, ApiError> {
    let message = match req.message.as_deref() {
        Some(m) if !m.is_empty() => m,
        _ => return Err(ApiError::BadRequest("no message provided".to_string())),
    };
    let outcome = dialogue::process_message(
        &app_state,
        req.session_id,
        req.caller_phone.as_deref(),
        message,
    )
    .await?;
    Ok(Json(json!({
        "response": outcome.reply.text(),
        "intent": outcome.intent,
        "session_id": outcome.session_id,
        "degraded": outcome.reply.is_degraded(),
    })))
}

pub async fn speech_to_text(
    State(app_state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let upload = read_audio_upload(multipart).await?;
    let language = upload.fields.get("language").cloned();
    let text = speech::speech_to_text(&app_state, upload.temp.path(), language.as_deref())
        .await
        .ok_or_else(|| ApiError::Internal("could not transcribe audio".to_string()))?;
    Ok(Json(json!({ "text": text })))
}

#[derive(Deserialize)]
pub struct TextToSpeechRequest {
    text: Option<String>,
    voice: Option<String>,
}

pub async fn text_to_speech(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<TextToSpeechRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let text = match req.text.as_deref() {
        Some(t) if !t.is_empty() => t,
        _ => return Err(ApiError::BadRequest("no text provided".to_string())),
    };
    let audio = speech::text_to_speech(&app_state, text, req.voice.as_deref())
        .await
        .ok_or_else(|| ApiError::Internal("could not synthesize audio".to_string()))?;
    Ok((audio_headers(None), audio))
}

pub async fn get_voices() -> Json<Value> {
    Json(json!({ "voices": speech::available_voices() }))
}

pub async fn get_session_info(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let call = dialogue::find_call(&app_state.db_pool, session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;
    Ok(Json(json!({
        "call": call,
        "active_turns": app_state.sessions.turn_count(session_id),
    })))
}

pub async fn end_session(
    State(app_state): State<Arc<AppState>>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Call>, ApiError> {
    let call = dialogue::end_conversation(&app_state, session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;
    Ok(Json(call))
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    20
}

#[derive(Deserialize)]
pub struct CallListParams {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_per_page")]
    per_page: i64,
    status: Option<String>,
    intent: Option<String>,
}

fn clamp_pagination(page: i64, per_page: i64) -> (i64, i64) {
    (page.max(1), per_page.clamp(1, 100))
}

fn page_count(total: i64, per_page: i64) -> i64 {
    if total == 0 {
        0
    } else {
        (total + per_page - 1) / per_page
    }
}

pub async fn get_calls(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<CallListParams>,
) -> Result<Json<Value>, ApiError> {
    let (page, per_page) = clamp_pagination(params.page, params.per_page);
    let total = sqlx::query_scalar::<_, i64>(
        "
        select count(*)
        from calls
        where ($1::text is null or status = $1)
          and ($2::text is null or intent = $2)
        ",
    )
    .bind(params.status.as_deref())
    .bind(params.intent.as_deref())
    .fetch_one(&app_state.db_pool)
    .await?;
    let calls = sqlx::query_as::<_, Call>(
        "
        select *
        from calls
        where ($1::text is null or status = $1)
          and ($2::text is null or intent = $2)
        order by started_at desc
        limit $3 offset $4
        ",
    )
    .bind(params.status.as_deref())
    .bind(params.intent.as_deref())
    .bind(per_page)
    .bind((page - 1) * per_page)
    .fetch_all(&app_state.db_pool)
    .await?;
    Ok(Json(json!({
        "calls": calls,
        "total": total,
        "pages": page_count(total, per_page),
        "current_page": page,
        "per_page": per_page,
    })))
}

pub async fn get_call(
    State(app_state): State<Arc<AppState>>,
    Path(call_id): Path<i32>,
) -> Result<Json<Call>, ApiError> {
    let call = sqlx::query_as::<_, Call>("select * from calls where id = $1")
        .bind(call_id)
        .fetch_optional(&app_state.db_pool)
        .await?
        .ok_or_else(|| ApiError::NotFound("call not found".to_string()))?;
    Ok(Json(call))
}

#[derive(Deserialize)]
pub struct AppointmentListParams {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_per_page")]
    per_page: i64,
    status: Option<String>,
}

pub async fn get_appointments(
    State(app_state): State<Arc<AppState>>,
    Query(params): Query<AppointmentListParams>,
) -> Result<Json<Value>, ApiError> {
    let (page, per_page) = clamp_pagination(params.page, params.per_page);
    let total = sqlx::query_scalar::<_, i64>(
        "select count(*) from appointments where ($1::text is null or status = $1)",
    )
    .bind(params.status.as_deref())
    .fetch_one(&app_state.db_pool)
    .await?;
    let appointments = sqlx::query_as::<_, Appointment>(
        "
        select *
        from appointments
        where ($1::text is null or status = $1)
        order by appointment_date desc nulls last, id desc
        limit $2 offset $3
        ",
    )
    .bind(params.status.as_deref())
    .bind(per_page)
    .bind((page - 1) * per_page)
    .fetch_all(&app_state.db_pool)
    .await?;
    Ok(Json(json!({
        "appointments": appointments,
        "total": total,
        "pages": page_count(total, per_page),
        "current_page": page,
        "per_page": per_page,
    })))
}

#[derive(Deserialize)]
pub struct CreateAppointmentRequest {
    session_id: Uuid,
    #[serde(flatten)]
    details: AppointmentDetails,
}

pub async fn create_appointment(
    State(app_state): State<Arc<AppState>>,
    Json(req): Json<CreateAppointmentRequest>,
) -> Result<Json<Value>, ApiError> {
    let call = dialogue::find_call(&app_state.db_pool, req.session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("session not found".to_string()))?;
    if !dialogue::create_appointment(&app_state, Some(&call), &req.details).await {
        return Err(ApiError::Internal(
            "could not create appointment".to_string(),
        ));
    }
    Ok(Json(json!({ "message": "appointment created" })))
}

#[derive(Deserialize)]
pub struct UpdateAppointmentRequest {
    status: Option<String>,
    notes: Option<String>,
}

/// Only `status` and `notes` are client-mutable; everything else on the row is
/// left untouched.
pub async fn update_appointment(
    State(app_state): State<Arc<AppState>>,
    Path(appointment_id): Path<i32>,
    Json(req): Json<UpdateAppointmentRequest>,
) -> Result<Json<Appointment>, ApiError> {
    let appointment = sqlx::query_as::<_, Appointment>(
        "
        update appointments
        set status = coalesce($1, status),
            notes = coalesce($2, notes),
            updated_at = now()
        where id = $3
        returning *
        ",
    )
    .bind(&req.status)
    .bind(&req.notes)
    .bind(appointment_id)
    .fetch_optional(&app_state.db_pool)
    .await?
    .ok_or_else(|| ApiError::NotFound("appointment not found".to_string()))?;
    Ok(Json(appointment))
}

pub async fn get_business_config(
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<HashMap<String, String>>, ApiError> {
    let rows = sqlx::query_as::<_, crate::db_types::BusinessConfig>(
        "select key, value from business_config",
    )
    .fetch_all(&app_state.db_pool)
    .await?;
    Ok(Json(rows.into_iter().map(|c| (c.key, c.value)).collect()))
}

fn config_value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

pub async fn update_business_config(
    State(app_state): State<Arc<AppState>>,
    Json(body): Json<HashMap<String, Value>>,
) -> Result<Json<Value>, ApiError> {
    for (key, value) in body {
        sqlx::query(
            "
            insert into business_config (key, value)
            values ($1, $2)
            on conflict (key) do update
            set value = excluded.value, updated_at = now()
            ",
        )
        .bind(&key)
        .bind(config_value_to_string(value))
        .execute(&app_state.db_pool)
        .await?;
    }
    Ok(Json(json!({ "message": "configuration updated successfully" })))
}
