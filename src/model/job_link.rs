use typed_builder::TypedBuilder;

use super::job::JobId;

/// Output artifact attached to a job. Appended only, unbounded per job.
#[derive(Debug, Clone, TypedBuilder, sqlx::FromRow)]
pub struct JobLink {
    pub job_id: JobId,
    pub href: String,
    pub rel: String,
    #[builder(default)]
    pub media_type: Option<String>,
    #[builder(default)]
    pub title: Option<String>,
    #[builder(default)]
    pub temporal_start: Option<chrono::DateTime<chrono::Utc>>,
    #[builder(default)]
    pub temporal_end: Option<chrono::DateTime<chrono::Utc>>,
    /// Stored as a `double precision[]` column; always 4 elements when
    /// present (`west,south,east,north`), validated at callback ingress
    /// (`callback::parse_bbox`) before it ever reaches this type.
    #[builder(default)]
    pub bbox: Option<Vec<f64>>,
}
