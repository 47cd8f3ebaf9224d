use serde_json::{json, Value};

use super::{answer_matches, content_hash, GradeResult, GradingStrategy, QuizSnapshot};
use crate::error::CoreError;
use crate::models::attempt::{AnswerMap, ItemScore};
use crate::models::quiz::QuizDoc;

/// Default quiz type: a flat list of items, optionally with a single total
/// time limit. An unanswered or mismatched item scores zero, full points
/// otherwise.
pub struct StandardQuiz;

impl GradingStrategy for StandardQuiz {
    fn quiz_type(&self) -> &'static str {
        "standard"
    }

    fn build_spec(&self, quiz: &QuizDoc) -> Result<QuizSnapshot, CoreError> {
        if quiz.items.is_empty() {
            return Err(CoreError::validation("quiz has no items"));
        }

        let mut render_items = Vec::with_capacity(quiz.items.len());
        let mut key_items = Vec::with_capacity(quiz.items.len());
        for item in &quiz.items {
            if item.points <= 0 {
                return Err(CoreError::validation(format!(
                    "item {} has non-positive points",
                    item.id
                )));
            }
            render_items.push(json!({
                "id": item.id,
                "prompt": item.prompt,
                "options": item.options,
                "points": item.points,
            }));
            key_items.push(json!({
                "id": item.id,
                "key": item.answer_key,
                "points": item.points,
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
            time_limit_seconds: quiz.total_time_limit_seconds,
        })
    }

    fn grade(&self, snapshot: &QuizSnapshot, answers: &AnswerMap) -> GradeResult {
        grade_by_key(snapshot, answers, |_item, given, key| {
            given.is_some_and(|value| answer_matches(key, value))
        })
    }
}

/// Walks the grading key and awards full or zero points per item based on
/// the `correct` predicate. Items missing from the key (malformed snapshot)
/// are skipped rather than failing the whole grade.
pub(crate) fn grade_by_key<F>(snapshot: &QuizSnapshot, answers: &AnswerMap, correct: F) -> GradeResult
where
    F: Fn(&Value, Option<&Value>, &Value) -> bool,
{
    let empty = Vec::new();
    let items = snapshot.grading_key["items"].as_array().unwrap_or(&empty);

    let mut total = 0;
    let mut max = 0;
    let mut breakdown = Vec::with_capacity(items.len());

    for item in items {
        let Some(item_id) = item["id"].as_str() else {
            continue;
        };
        let points = item["points"].as_i64().unwrap_or(0);
        let given = answers.get(item_id);
        let awarded = if correct(item, given, &item["key"]) {
            points
        } else {
            0
        };

        total += awarded;
        max += points;
        breakdown.push(ItemScore {
            item_id: item_id.to_string(),
            awarded,
            max: points,
            meta: None,
        });
    }

    GradeResult {
        total,
        max,
        breakdown,
    }
}
