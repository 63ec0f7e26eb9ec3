//! Prompt templates used during synthesis.

/// Answer `query` from a single block of context.
pub(crate) fn answer_prompt(query: &str, context: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str("Context information is below.\n");
    prompt.push_str("---------------------\n");
    prompt.push_str(context.trim());
    prompt.push_str("\n---------------------\n");
    prompt.push_str(
        "Using only the context above and no prior knowledge, respond to the request.\n",
    );
    prompt.push_str(&format!("Request: {}\nResponse: ", query.trim()));
    prompt
}

/// Improve `existing` with an additional block of context.
pub(crate) fn refine_prompt(query: &str, existing: &str, context: &str) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!("The original request is: {}\n", query.trim()));
    prompt.push_str(&format!("An existing response is: {}\n", existing.trim()));
    prompt.push_str(
        "Refine the existing response, only if needed, using the additional context below.\n",
    );
    prompt.push_str("---------------------\n");
    prompt.push_str(context.trim());
    prompt.push_str("\n---------------------\n");
    prompt.push_str(
        "If the context does not help, repeat the existing response unchanged.\nRefined response: ",
    );
    prompt
}

/// Merge partial responses produced from different parts of the content.
pub(crate) fn combine_prompt(query: &str, partials: &[String]) -> String {
    let mut prompt = String::new();
    prompt.push_str("Several partial responses were written from different parts of the content.\n");
    for (idx, partial) in partials.iter().enumerate() {
        prompt.push_str(&format!("Part {}: {}\n", idx + 1, partial.trim()));
    }
    prompt.push_str("Combine them into one coherent response to the request.\n");
    prompt.push_str(&format!("Request: {}\nResponse: ", query.trim()));
    prompt
}
