//! Centralised prompt texts for the two enrichment passes.
//!
//! Every LLM prompt lives here so it can be audited and tuned in one place.

use crate::ai::LinkDigest;

// ---------------------------------------------------------------------------
// description pass
// ---------------------------------------------------------------------------

pub const DESCRIBE_SYSTEM: &str = "You write a very short, plain description (at most 25 words) \
    of the web page at a given URL. Return only the description: no quotes, no markdown, \
    no preamble.";

pub fn describe_prompt(url: &str) -> String {
    format!("Write a short description for this URL: {url}")
}

// ---------------------------------------------------------------------------
// grouping pass
// ---------------------------------------------------------------------------

pub const GROUP_SYSTEM: &str = "You are a helpful assistant that organises saved links. \
    Respond strictly in English. Return only a valid JSON array as specified.";

pub fn group_prompt(links: &[LinkDigest]) -> String {
    let mut prompt = String::from(
        "For each link below (with optional description and tags), assign a concise thematic \
         group title in English. Reuse the same title for links that belong together. \
         Return a JSON array with entries in the form:\n\
         [\n  { \"url\": \"...\", \"group_title\": \"Programming\" },\n  \
         { \"url\": \"...\", \"group_title\": \"Entertainment\" }\n]\nLinks:\n",
    );
    for (i, l) in links.iter().enumerate() {
        prompt.push_str(&format!(
            "{}. {} ({}) - {}\n",
            i + 1,
            l.url,
            l.tags,
            l.description.as_deref().unwrap_or("")
        ));
    }
    prompt
}
