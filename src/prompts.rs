//! Prompt text used by the chain and the extraction engine.
//!
//! Kept in one place so the wording can be tuned without touching control
//! flow. Builders return plain strings; the callers wrap them into chat
//! messages via `crate::gateway`.

/// System instruction for grounded answering.
pub const ANSWER_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer the user's \
question using the provided context. If the context does not contain the answer, say so \
plainly instead of guessing.";

/// System instruction for the query-rewriting call.
pub const REWRITE_SYSTEM_PROMPT: &str = "You reformulate follow-up questions. Given a \
conversation and a follow-up question, produce a single standalone search query that \
resolves every pronoun and ellipsis against the conversation. Reply with the query only, \
no explanations.";

/// User content for the query-rewriting call.
pub fn rewrite_request(history: &str, question: &str) -> String {
    format!("Conversation so far:\n{history}\n\nFollow-up question: {question}\n\nStandalone search query:")
}

/// The final user turn of a grounded answer request: retrieved context followed
/// by the original question.
pub fn context_question_block(context: &str, question: &str) -> String {
    format!("Context: {context}\n\nQuestion: {question}\n\nAnswer:")
}

/// Prompt for the attribute extraction call.
///
/// Names exactly the required attributes, demands a minimal JSON object
/// restricted to those keys, and forbids any surrounding text.
pub fn extraction_request(required_attributes: &[String], text: &str) -> String {
    let names = required_attributes.join(", ");
    format!(
        "You extract personal information from conversations.\n\
         \n\
         STRICT RULES:\n\
         1. Analyze the text below and extract ONLY the following attributes: {names}\n\
         2. Reply EXCLUSIVELY with a valid JSON object\n\
         3. If an attribute is not found, leave it out of the reply\n\
         4. Values must be plain strings\n\
         5. Return no explanatory text, only the JSON\n\
         \n\
         ATTRIBUTES TO EXTRACT: {names}\n\
         \n\
         TEXT TO ANALYZE:\n\
         {text}\n\
         \n\
         JSON REPLY:"
    )
}

/// Prompt for the first-conversation welcome message.
pub fn welcome_request(user_id: &str) -> String {
    format!(
        "Write a short, warm greeting for a user starting their first conversation with \
         this assistant. One or two sentences, no questions about personal data. The user's \
         identifier is {user_id}; do not repeat it verbatim."
    )
}
