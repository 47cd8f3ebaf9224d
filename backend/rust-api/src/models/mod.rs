pub mod attempt;
pub mod event;
pub mod outbox;
pub mod quiz;

pub use attempt::{
    AnswerMap, Attempt, AttemptState, AttemptView, FinalizeTrigger, ItemScore,
    StartAttemptRequest, SubmitAnswersRequest,
};
pub use outbox::{OutboxEvent, OutboxStatus};
pub use quiz::{QuizDoc, QuizItem};
