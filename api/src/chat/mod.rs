//! Turn orchestration: the streaming loop, its wire events, text shaping,
//! and session persistence.

pub mod driver;
pub mod events;
pub mod reasoning;
pub mod smooth;
pub mod store;

use chrono::Utc;

/// The system prompt for every turn. Dated so the model does not guess.
pub fn system_prompt() -> String {
    format!(
        "You are a helpful assistant. Use the available tools when they help \
         answer the question, and answer directly when they do not. \
         Today's date is {}.",
        Utc::now().format("%Y-%m-%d")
    )
}
