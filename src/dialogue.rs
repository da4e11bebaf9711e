use crate::consts;
use crate::db_types::{BusinessConfig, Call};
use crate::openai_types::{OpenAIBatchResponse, OpenAIMessage, OpenAIPayload};
use crate::types::{AppState, ChatReply, DialogueOutcome};

use serde::Deserialize;
use sqlx::{Pool, Postgres};
use std::collections::HashMap;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Intent label set as soon as a caller message matches the appointment keywords.
pub const INTENT_SCHEDULING: &str = "appointment_scheduling";
/// Intent label set once an appointment row has actually been written.
pub const INTENT_SCHEDULED: &str = "appointment_scheduled";

/// Appointment fields supplied by the client; customer phone comes from the call row.
#[derive(Deserialize, Debug, Default)]
pub struct AppointmentDetails {
    pub customer_name: Option<String>,
    pub customer_email: Option<String>,
    pub service_type: Option<String>,
    pub appointment_date: Option<String>,
    pub appointment_time: Option<String>,
    pub notes: Option<String>,
}

/// Resolve the OpenAI API key: stored business config wins, environment is the
/// fallback.  A config read failure only degrades to the environment key.
pub async fn resolve_api_key(app_state: &AppState) -> Option<String> {
    let stored = sqlx::query_as::<_, BusinessConfig>(
        "select key, value from business_config where key = $1",
    )
    .bind(consts::API_KEY_CONFIG_KEY)
    .fetch_optional(&app_state.db_pool)
    .await;
    match stored {
        Ok(Some(config)) if !config.value.is_empty() => Some(config.value),
        Ok(_) => app_state.openai_api_key.clone(),
        Err(e) => {
            warn!(error=%e, "failed to read api key from business config");
            app_state.openai_api_key.clone()
        }
    }
}

async fn get_business_context(pool: &Pool<Postgres>) -> HashMap<String, String> {
    let keys: Vec<String> = consts::PROMPT_CONFIG_KEYS
        .iter()
        .map(|k| k.to_string())
        .collect();
    let rows = sqlx::query_as::<_, BusinessConfig>(
        "select key, value from business_config where key = any($1)",
    )
    .bind(&keys)
    .fetch_all(pool)
    .await;
    match rows {
        Ok(rows) => rows.into_iter().map(|c| (c.key, c.value)).collect(),
        Err(e) => {
            warn!(error=%e, "failed to read business context; prompt will use placeholders");
            HashMap::new()
        }
    }
}

/// Template the receptionist system prompt from business config.  Missing keys
/// render as `[<key> not configured]` rather than failing the turn.
pub fn build_system_prompt(context: &HashMap<String, String>) -> String {
    let get = |key: &str| {
        context
            .get(key)
            .cloned()
            .unwrap_or_else(|| format!("[{key} not configured]"))
    };
    let business_name = get("business_name");
    format!(
        "You are an AI receptionist for {business_name}. You are professional, helpful, and friendly.\n\
         \n\
         Business Information:\n\
         - Business Name: {business_name}\n\
         - Hours: {}\n\
         - Address: {}\n\
         - Phone: {}\n\
         - Email: {}\n\
         - Services: {}\n\
         \n\
         Your responsibilities:\n\
         1. Greet callers professionally\n\
         2. Answer questions about the business\n\
         3. Help schedule appointments\n\
         4. Provide information about services\n\
         5. Take messages when needed\n\
         6. Transfer calls when appropriate\n\
         \n\
         Guidelines:\n\
         - Keep responses conversational and natural\n\
         - Be helpful and patient\n\
         - If you don't know something, say so and offer to take a message\n\
         - For appointments, ask for preferred date/time, contact info, and reason for visit\n\
         - Always confirm important details back to the caller\n\
         \n\
         Respond naturally as if you're speaking on the phone.",
        get("business_hours"),
        get("business_address"),
        get("business_phone"),
        get("business_email"),
        get("services"),
    )
}

/// Case-insensitive match-any against the fixed keyword list.  A heuristic, not
/// NLU; false positives and negatives are acceptable.
pub fn detect_appointment_intent(message: &str) -> bool {
    let lowered = message.to_lowercase();
    consts::APPOINTMENT_KEYWORDS
        .iter()
        .any(|keyword| lowered.contains(keyword))
}

pub async fn find_call(
    pool: &Pool<Postgres>,
    session_id: Uuid,
) -> Result<Option<Call>, sqlx::Error> {
    sqlx::query_as::<_, Call>("select * from calls where session_id = $1")
        .bind(session_id)
        .fetch_optional(pool)
        .await
}

async fn get_or_create_call(
    app_state: &AppState,
    session_id: Uuid,
    caller_phone: Option<&str>,
) -> Result<Call, sqlx::Error> {
    if let Some(call) = find_call(&app_state.db_pool, session_id).await? {
        return Ok(call);
    }
    sqlx::query_as::<_, Call>(
        "insert into calls (session_id, caller_phone) values ($1, $2) returning *",
    )
    .bind(session_id)
    .bind(caller_phone)
    .fetch_one(&app_state.db_pool)
    .await
}

async fn append_transcript(
    pool: &Pool<Postgres>,
    call_id: i32,
    speaker: &str,
    text: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("update calls set transcript = transcript || $1 where id = $2")
        .bind(format!("{speaker}: {text}\n"))
        .bind(call_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// One best-effort chat-completion request.  Any vendor failure (missing key,
/// network, auth, quota, malformed body) is logged and collapsed to `None` so
/// the turn can degrade instead of erroring.
async fn request_chat_completion(
    app_state: &AppState,
    messages: Vec<OpenAIMessage>,
) -> Option<String> {
    let key = match resolve_api_key(app_state).await {
        Some(key) => key,
        None => {
            warn!("no OpenAI API key available; degrading");
            return None;
        }
    };
    let url = "https://api.openai.com/v1/chat/completions";
    let payload = OpenAIPayload {
        model: consts::CHAT_MODEL.to_string(),
        messages,
        max_tokens: Some(consts::CHAT_MAX_TOKENS),
        temperature: Some(consts::CHAT_TEMPERATURE),
    };
    let resp = app_state
        .http_client
        .post(url)
        .header(reqwest::header::AUTHORIZATION, format!("Bearer {key}"))
        .json(&payload)
        .send()
        .await
        .and_then(|r| r.error_for_status());
    let resp = match resp {
        Ok(resp) => resp,
        Err(e) => {
            error!(error=%e, "chat completion request failed");
            return None;
        }
    };
    let batch = match resp.json::<OpenAIBatchResponse>().await {
        Ok(batch) => batch,
        Err(e) => {
            error!(error=%e, "failed to deserialize chat completion response");
            return None;
        }
    };
    batch
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
}

/// Run one dialogue turn: record the caller message, ask the model with the full
/// history behind a config-templated system prompt, record the reply, and update
/// intent.  Vendor failures return a `Degraded` reply; persistence failures
/// propagate.
pub async fn process_message(
    app_state: &AppState,
    session_id: Option<Uuid>,
    caller_phone: Option<&str>,
    user_text: &str,
) -> Result<DialogueOutcome, sqlx::Error> {
    let session_id = session_id.unwrap_or_else(Uuid::new_v4);
    let call = get_or_create_call(app_state, session_id, caller_phone).await?;

    app_state.sessions.append(
        session_id,
        OpenAIMessage {
            role: "user".to_string(),
            content: user_text.to_string(),
        },
    );
    append_transcript(&app_state.db_pool, call.id, "Caller", user_text).await?;

    let context = get_business_context(&app_state.db_pool).await;
    let mut messages = vec![OpenAIMessage {
        role: "system".to_string(),
        content: build_system_prompt(&context),
    }];
    messages.extend(app_state.sessions.snapshot(session_id));
    debug!(session_id=%session_id, turns=messages.len() - 1, "sending conversation to openai");

    let reply = match request_chat_completion(app_state, messages).await {
        Some(reply) => reply,
        None => {
            return Ok(DialogueOutcome {
                session_id,
                reply: ChatReply::Degraded(consts::FALLBACK_REPLY.to_string()),
                intent: call.intent,
            });
        }
    };

    app_state.sessions.append(
        session_id,
        OpenAIMessage {
            role: "assistant".to_string(),
            content: reply.clone(),
        },
    );
    append_transcript(&app_state.db_pool, call.id, "Assistant", &reply).await?;

    let intent = if detect_appointment_intent(user_text) {
        sqlx::query("update calls set intent = $1 where id = $2")
            .bind(INTENT_SCHEDULING)
            .bind(call.id)
            .execute(&app_state.db_pool)
            .await?;
        Some(INTENT_SCHEDULING.to_string())
    } else {
        call.intent
    };

    Ok(DialogueOutcome {
        session_id,
        reply: ChatReply::Answered(reply),
        intent,
    })
}

/// Book an appointment for an existing call.  The caller passes the call row it
/// already fetched; a missing call reports `false` without touching the
/// database.  Insert and call update share one transaction; any failure rolls
/// back and reports `false`, leaving no partial state.
pub async fn create_appointment(
    app_state: &AppState,
    call: Option<&Call>,
    details: &AppointmentDetails,
) -> bool {
    let call = match call {
        Some(call) => call,
        None => {
            warn!("appointment requested for unknown call");
            return false;
        }
    };
    match insert_appointment(app_state, call, details).await {
        Ok(()) => true,
        Err(e) => {
            error!(error=%e, call_id=call.id, "appointment creation failed; rolled back");
            false
        }
    }
}

async fn insert_appointment(
    app_state: &AppState,
    call: &Call,
    details: &AppointmentDetails,
) -> Result<(), sqlx::Error> {
    let mut tx = app_state.db_pool.begin().await?;
    sqlx::query(
        "
        insert into appointments (
          call_id,
          customer_name,
          customer_phone,
          customer_email,
          service_type,
          appointment_date,
          appointment_time,
          notes
        ) values ($1, $2, $3, $4, $5, $6, $7, $8)
        ",
    )
    .bind(call.id)
    .bind(&details.customer_name)
    .bind(&call.caller_phone)
    .bind(&details.customer_email)
    .bind(&details.service_type)
    .bind(&details.appointment_date)
    .bind(&details.appointment_time)
    .bind(&details.notes)
    .execute(&mut *tx)
    .await?;
    sqlx::query("update calls set intent = $1, appointment_booked = true where id = $2")
        .bind(INTENT_SCHEDULED)
        .bind(call.id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Discard in-memory history and close the call record.  Safe to call twice: the
/// second history clear is a no-op, and the call row just gets its completion
/// fields rewritten.
pub async fn end_conversation(
    app_state: &AppState,
    session_id: Uuid,
) -> Result<Option<Call>, sqlx::Error> {
    if !app_state.sessions.clear(session_id) {
        debug!(session_id=%session_id, "no live history to discard");
    }
    sqlx::query_as::<_, Call>(
        "update calls set status = 'completed', ended_at = now() where session_id = $1 returning *",
    )
    .bind(session_id)
    .fetch_optional(&app_state.db_pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_types::Appointment;
    use crate::types::test_support;

    #[test]
    fn intent_detection_is_case_insensitive() {
        assert!(detect_appointment_intent("Can I BOOK a visit?"));
        assert!(detect_appointment_intent("is anyone Available tomorrow"));
        assert!(detect_appointment_intent("I need to see the doctor"));
    }

    #[test]
    fn intent_detection_matches_any_keyword() {
        for keyword in consts::APPOINTMENT_KEYWORDS {
            let message = format!("hello, {keyword} please");
            assert!(detect_appointment_intent(&message), "missed {keyword}");
        }
    }

    #[test]
    fn intent_detection_ignores_unrelated_messages() {
        assert!(!detect_appointment_intent("What are your hours?"));
        assert!(!detect_appointment_intent(""));
        assert!(!detect_appointment_intent("where are you located"));
    }

    #[test]
    fn prompt_templates_configured_values() {
        let mut context = HashMap::new();
        context.insert("business_name".to_string(), "Acme Dental".to_string());
        context.insert("business_hours".to_string(), "9-5 Mon-Fri".to_string());
        let prompt = build_system_prompt(&context);
        assert!(prompt.contains("AI receptionist for Acme Dental"));
        assert!(prompt.contains("- Hours: 9-5 Mon-Fri"));
    }

    #[test]
    fn prompt_renders_placeholders_for_missing_keys() {
        let prompt = build_system_prompt(&HashMap::new());
        assert!(prompt.contains("[business_name not configured]"));
        assert!(prompt.contains("- Services: [services not configured]"));
    }

    #[tokio::test]
    async fn appointment_creation_requires_an_existing_call() {
        // The lazy pool never connects, so a pass proves the unknown-call
        // branch writes nothing.
        let state = test_support::lazy_state();
        let created = create_appointment(&state, None, &AppointmentDetails::default()).await;
        assert!(!created);
    }

    #[tokio::test]
    async fn appointment_for_unknown_call_writes_no_row() {
        let state = match test_support::db_state().await {
            Some(state) => state,
            None => return,
        };
        let missing = Uuid::new_v4();
        let call = find_call(&state.db_pool, missing).await.unwrap();
        assert!(call.is_none());
        let before = sqlx::query_scalar::<_, i64>("select count(*) from appointments")
            .fetch_one(&state.db_pool)
            .await
            .unwrap();
        assert!(!create_appointment(&state, call.as_ref(), &AppointmentDetails::default()).await);
        let after = sqlx::query_scalar::<_, i64>("select count(*) from appointments")
            .fetch_one(&state.db_pool)
            .await
            .unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn appointment_creation_books_the_call() {
        let state = match test_support::db_state().await {
            Some(state) => state,
            None => return,
        };
        let session_id = Uuid::new_v4();
        let call = sqlx::query_as::<_, Call>(
            "insert into calls (session_id, caller_phone) values ($1, $2) returning *",
        )
        .bind(session_id)
        .bind("+15550001111")
        .fetch_one(&state.db_pool)
        .await
        .unwrap();
        let details = AppointmentDetails {
            customer_name: Some("Pat Jones".to_string()),
            service_type: Some("cleaning".to_string()),
            appointment_date: Some("2026-09-15".to_string()),
            ..Default::default()
        };
        assert!(create_appointment(&state, Some(&call), &details).await);
        let appointment = sqlx::query_as::<_, Appointment>(
            "select * from appointments where call_id = $1",
        )
        .bind(call.id)
        .fetch_one(&state.db_pool)
        .await
        .unwrap();
        // customer phone comes from the call row, not the request
        assert_eq!(appointment.customer_phone.as_deref(), Some("+15550001111"));
        assert_eq!(appointment.customer_name.as_deref(), Some("Pat Jones"));
        assert_eq!(appointment.status, "scheduled");
        let call = find_call(&state.db_pool, session_id).await.unwrap().unwrap();
        assert!(call.appointment_booked);
        assert_eq!(call.intent.as_deref(), Some(INTENT_SCHEDULED));
    }
}
