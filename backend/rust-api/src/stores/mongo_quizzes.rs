use anyhow::{Context, Result};
use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::{Collection, Database};

use super::QuizStore;
use crate::models::quiz::QuizDoc;

const COLLECTION: &str = "quizzes";

pub struct MongoQuizStore {
    collection: Collection<QuizDoc>,
}

impl MongoQuizStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection(COLLECTION),
        }
    }
}

#[async_trait]
impl QuizStore for MongoQuizStore {
    async fn find(&self, quiz_id: &str) -> Result<Option<QuizDoc>> {
        self.collection
            .find_one(doc! { "_id": quiz_id })
            .await
            .context("Failed to query quiz")
    }
}
