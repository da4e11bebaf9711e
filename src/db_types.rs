use serde::Serialize;
use sqlx::types::time::OffsetDateTime;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(FromRow, Serialize, Debug)]
pub struct Call {
    pub id: i32,
    pub session_id: Uuid,
    pub caller_phone: Option<String>,
    pub status: String,
    pub intent: Option<String>,
    pub transcript: String,
    pub started_at: OffsetDateTime,
    pub ended_at: Option<OffsetDateTime>,
    pub appointment_booked: bool,
}

#[derive(FromRow, Serialize, Debug)]
pub struct Appointment {
    pub id: i32,
    pub call_id: i32,
    pub customer_name: Option<String>,
    pub customer_phone: Option<String>,
    pub customer_email: Option<String>,
    pub service_type: Option<String>,
    pub appointment_date: Option<String>,
    pub appointment_time: Option<String>,
    pub notes: Option<String>,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(FromRow, Debug)]
pub struct BusinessConfig {
    pub key: String,
    pub value: String,
}
