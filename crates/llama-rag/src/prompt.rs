//! Retrieval-augmented prompt construction.

/// Append the retrieved context to the user prompt, separated by one space.
///
/// A missing or empty context leaves the prompt untouched.
pub fn augment_prompt(prompt: &str, context: Option<&str>) -> String {
    match context {
        Some(ctx) if !ctx.is_empty() => {
            let mut augmented = String::with_capacity(prompt.len() + 1 + ctx.len());
            augmented.push_str(prompt);
            augmented.push(' ');
            augmented.push_str(ctx);
            augmented
        }
        _ => prompt.to_string(),
    }
}
