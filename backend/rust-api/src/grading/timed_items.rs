use serde_json::{json, Value};

use super::standard::grade_by_key;
use super::{answer_matches, content_hash, GradeResult, GradingStrategy, QuizSnapshot};
use crate::error::CoreError;
use crate::models::attempt::AnswerMap;
use crate::models::quiz::QuizDoc;

/// Per-item-timed quiz type. Every item carries its own limit; the quiz's
/// intrinsic time budget is the sum of the item limits. Answer payloads are
/// objects of the form `{"value": ..., "elapsed_seconds": ...}`; an answer
/// that arrived over its item's limit scores zero.
pub struct TimedItemsQuiz;

impl GradingStrategy for TimedItemsQuiz {
    fn quiz_type(&self) -> &'static str {
        "timed_items"
    }

    fn build_spec(&self, quiz: &QuizDoc) -> Result<QuizSnapshot, CoreError> {
        if quiz.items.is_empty() {
            return Err(CoreError::validation("quiz has no items"));
        }

        let mut total_limit: u32 = 0;
        let mut render_items = Vec::with_capacity(quiz.items.len());
        let mut key_items = Vec::with_capacity(quiz.items.len());
        for item in &quiz.items {
            let Some(limit) = item.time_limit_seconds else {
                return Err(CoreError::validation(format!(
                    "item {} is missing a time limit",
                    item.id
                )));
            };
            if limit == 0 || item.points <= 0 {
                return Err(CoreError::validation(format!(
                    "item {} has a zero time limit or non-positive points",
                    item.id
                )));
            }
            total_limit = total_limit.saturating_add(limit);
            render_items.push(json!({
                "id": item.id,
                "prompt": item.prompt,
                "options": item.options,
                "points": item.points,
                "time_limit_seconds": limit,
            }));
            key_items.push(json!({
                "id": item.id,
                "key": item.answer_key,
                "points": item.points,
                "time_limit_seconds": limit,
            }));
        }

        let render_spec = json!({ "items": render_items });
        let grading_key = json!({ "items": key_items });

        Ok(QuizSnapshot {
            quiz_id: quiz.id.clone(),
            quiz_root_id: quiz.root_id.clone(),
            quiz_version: quiz.version,
            quiz_type: self.quiz_type().to_string(),
            title: quiz.title.clone(),
            content_hash: content_hash(&render_spec, &grading_key),
            render_spec,
            grading_key,
            time_limit_seconds: Some(total_limit),
        })
    }

    fn grade(&self, snapshot: &QuizSnapshot, answers: &AnswerMap) -> GradeResult {
        grade_by_key(snapshot, answers, |item, given, key| {
            let Some(payload) = given else {
                return false;
            };
            let limit = item["time_limit_seconds"].as_u64();
            if let (Some(limit), Some(elapsed)) = (limit, payload["elapsed_seconds"].as_u64()) {
                if elapsed > limit {
                    return false;
                }
            }
            answer_matches(key, answer_value(payload))
        })
    }
}

/// Answers may arrive bare or wrapped in a timing envelope.
fn answer_value(payload: &Value) -> &Value {
    match payload.get("value") {
        Some(value) => value,
        None => payload,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::quiz::QuizItem;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn quiz() -> QuizDoc {
        QuizDoc {
            id: "q2".into(),
            root_id: "root2".into(),
            version: 2,
            quiz_type: "timed_items".into(),
            title: "Speed round".into(),
            total_time_limit_seconds: None,
            items: vec![
                QuizItem {
                    id: "i1".into(),
                    prompt: "3 + 4".into(),
                    options: None,
                    answer_key: json!("7"),
                    points: 1,
                    time_limit_seconds: Some(10),
                },
                QuizItem {
                    id: "i2".into(),
                    prompt: "9 - 2".into(),
                    options: None,
                    answer_key: json!("7"),
                    points: 1,
                    time_limit_seconds: Some(15),
                },
            ],
        }
    }

    #[test]
    fn intrinsic_budget_is_the_sum_of_item_limits() {
        let snapshot = TimedItemsQuiz.build_spec(&quiz()).unwrap();
        assert_eq!(snapshot.time_limit_seconds, Some(25));
    }

    #[test]
    fn missing_item_limit_is_rejected() {
        let mut broken = quiz();
        broken.items[1].time_limit_seconds = None;
        assert!(matches!(
            TimedItemsQuiz.build_spec(&broken),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn late_answers_score_zero() {
        let snapshot = TimedItemsQuiz.build_spec(&quiz()).unwrap();
        let mut answers = BTreeMap::new();
        answers.insert(
            "i1".to_string(),
            json!({"value": "7", "elapsed_seconds": 9}),
        );
        answers.insert(
            "i2".to_string(),
            json!({"value": "7", "elapsed_seconds": 16}),
        );

        let grade = TimedItemsQuiz.grade(&snapshot, &answers);
        assert_eq!(grade.total, 1);
        assert_eq!(grade.max, 2);
    }

    #[test]
    fn bare_answers_grade_without_timing() {
        let snapshot = TimedItemsQuiz.build_spec(&quiz()).unwrap();
        let mut answers = BTreeMap::new();
        answers.insert("i1".to_string(), json!("7"));

        let grade = TimedItemsQuiz.grade(&snapshot, &answers);
        assert_eq!(grade.total, 1);
    }
}
