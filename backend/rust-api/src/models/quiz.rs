use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Quiz document as authored upstream. Attempts never read it after `start`;
/// everything grading needs is copied into the attempt's snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizDoc {
    #[serde(rename = "_id")]
    pub id: String,
    pub root_id: String,
    pub version: i64,
    pub quiz_type: String,
    pub title: String,
    pub total_time_limit_seconds: Option<u32>,
    pub items: Vec<QuizItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizItem {
    pub id: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub answer_key: Value,
    pub points: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit_seconds: Option<u32>,
}
