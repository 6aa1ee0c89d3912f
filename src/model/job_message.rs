use typed_builder::TypedBuilder;

use super::job::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, serde::Serialize, serde::Deserialize)]
#[sqlx(type_name = "message_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageLevel {
    Error,
    Warning,
}

/// Error or warning attached to a job. Appended only.
#[derive(Debug, Clone, TypedBuilder, sqlx::FromRow)]
pub struct JobMessage {
    pub job_id: JobId,
    #[builder(default)]
    pub url: Option<String>,
    pub message: String,
    pub level: MessageLevel,
    #[builder(default)]
    pub category: Option<String>,
}
