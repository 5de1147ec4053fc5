//! Embedded fallback prompt templates, used when neither a user override
//! nor a repo default exists for a given template name.

const TASK: &str = include_str!("templates/task.hbs");
const CODE_REVIEW_FIX: &str = include_str!("templates/code-review-fix.hbs");
const MERGE_CONFLICT: &str = include_str!("templates/merge-conflict.hbs");
const PR_REVIEW_FEEDBACK: &str = include_str!("templates/pr-review-feedback.hbs");

pub fn get_embedded(name: &str) -> Option<&'static str> {
    match name {
        "task" => Some(TASK),
        "code-review-fix" => Some(CODE_REVIEW_FIX),
        "merge-conflict" => Some(MERGE_CONFLICT),
        "pr-review-feedback" => Some(PR_REVIEW_FEEDBACK),
        _ => None,
    }
}
