//! Prompt assembly and reference clean-up for generated answers.
//!
//! Retrieved chunks are rendered as quoted extracts under their source URL.
//! The model is asked to finish with a `References:` list; on the way back
//! the list is parsed and every URL the model could not have seen in the
//! extracts is dropped.

use std::collections::HashSet;

use docent_index::{Chunk, ScoredChunk};
use docent_llm::Message;

pub const SYSTEM_PROMPT: &str = "\
You are a member of the support staff answering questions about this documentation.
Generate a concise and informative answer for the given question solely based on the provided information (URL and Extract).
You must only use information from the provided extracts. \
Use an unbiased and journalistic tone. \
Combine the extracts together into a coherent answer. \
Only cite the most relevant results that answer the question accurately. \
Try and be careful not to go off-topic. \
After providing the answer, list the URLs of the information sources you used in a `References:` section, \
sorted from most to least relevant, one per line formatted as ` * <url>`. \
Include ONLY the URLs that are directly relevant to the answer.

### Information Sources:
";

/// Headers a model may use to open its list of sources.
pub const REFERENCE_HEADERS: [&str; 6] = [
    "References:",
    "Reference(s):",
    "Sources:",
    "Ressources:",
    "Source URL:",
    "Source URLs:",
];

/// `Source URL: <url>` followed by the chunk text as a markdown quote.
#[must_use]
pub fn render_chunk(chunk: &Chunk) -> String {
    let mut out = format!("Source URL: <{}>\n\nExtract:\n", chunk.url);
    for line in chunk.text.lines() {
        out.push_str("> ");
        out.push_str(line);
        out.push('\n');
    }
    out.push_str("\n---\n");
    out
}

/// Messages for one question. Chunks are added in rank order while the
/// rendered context stays within `max_context_chars`; the best chunk is
/// always included.
#[must_use]
pub fn build_messages(question: &str, chunks: &[ScoredChunk], max_context_chars: usize) -> Vec<Message> {
    let mut system = String::from(SYSTEM_PROMPT);
    let mut used = 0usize;
    for (i, scored) in chunks.iter().enumerate() {
        let rendered = render_chunk(&scored.chunk);
        let len = rendered.chars().count();
        if i > 0 && used + len > max_context_chars {
            tracing::debug!(kept = i, dropped = chunks.len() - i, "context budget reached");
            break;
        }
        used += len;
        system.push('\n');
        system.push_str(&rendered);
    }
    vec![Message::system(system), Message::user(question)]
}

/// Cut the answer at the first references header. Returns the trimmed body
/// and the URLs listed after the header. Without a header, a trailing run
/// of ` * <url>` bullets is taken as the list.
#[must_use]
pub fn split_references(text: &str) -> (&str, Vec<String>) {
    let header = REFERENCE_HEADERS
        .iter()
        .filter_map(|h| text.find(h).map(|pos| (pos, h.len())))
        .min();
    if let Some((pos, len)) = header {
        return (text[..pos].trim_end(), cited_urls(&text[pos + len..]));
    }

    let trimmed = text.trim_end();
    let mut cut = trimmed.len();
    for line in trimmed.lines().rev() {
        if is_bullet_reference(line) {
            cut -= line.len();
            cut = trimmed[..cut].trim_end_matches(['\n', '\r']).len();
        } else {
            break;
        }
    }
    (trimmed[..cut].trim_end(), cited_urls(&trimmed[cut..]))
}

fn is_bullet_reference(line: &str) -> bool {
    let line = line.trim();
    (line.starts_with('*') || line.starts_with('-')) && line.contains('<') && line.ends_with('>')
}

/// URLs in a references section: `<url>`, `[text](url)` or bare http(s) links.
#[must_use]
pub fn cited_urls(section: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for line in section.lines() {
        let mut found = bracketed(line, '<', '>');
        if found.is_empty() {
            found = bracketed(line, '(', ')')
                .into_iter()
                .filter(|u| line.contains(&format!("]({u})")))
                .collect();
        }
        if found.is_empty() {
            found = line
                .split_whitespace()
                .filter(|t| t.starts_with("http://") || t.starts_with("https://"))
                .map(|t| t.trim_end_matches(['.', ',', ';', ')']))
                .collect();
        }
        for url in found {
            let url = url.trim();
            if !url.is_empty() && seen.insert(url.to_owned()) {
                urls.push(url.to_owned());
            }
        }
    }
    urls
}

fn bracketed(line: &str, open: char, close: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut rest = line;
    while let Some(start) = rest.find(open) {
        let after = &rest[start + open.len_utf8()..];
        let Some(end) = after.find(close) else {
            break;
        };
        out.push(&after[..end]);
        rest = &after[end + close.len_utf8()..];
    }
    out
}

/// `url` without its last `#fragment`.
#[must_use]
pub fn stem_url(url: &str) -> &str {
    url.rfind('#').map_or(url, |pos| &url[..pos])
}

/// Cited URLs that point at a retrieved chunk or occur in a chunk's text,
/// in citation order.
#[must_use]
pub fn validate_references(cited: &[String], chunks: &[ScoredChunk], stem: bool) -> Vec<String> {
    let stemmer = |url: &str| -> String {
        if stem { stem_url(url).to_owned() } else { url.to_owned() }
    };
    let known: HashSet<String> = chunks.iter().map(|c| stemmer(&c.chunk.url)).collect();
    cited
        .iter()
        .filter(|url| {
            let candidate = stemmer(url);
            known.contains(&candidate) || chunks.iter().any(|c| c.chunk.text.contains(&candidate))
        })
        .cloned()
        .collect()
}

/// ` * <url>` lines.
#[must_use]
pub fn format_reference_list(urls: &[String]) -> String {
    urls.iter()
        .map(|url| format!(" * <{url}>"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[must_use]
pub fn format_answer(body: &str, references: &[String]) -> String {
    if references.is_empty() {
        return body.to_owned();
    }
    format!("{body}\n\nReferences:\n{}", format_reference_list(references))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use docent_index::ChunkId;

    use super::*;

    fn scored(url: &str, text: &str) -> ScoredChunk {
        ScoredChunk {
            chunk: Arc::new(Chunk {
                id: ChunkId::derive(url, 0, text),
                path: "jobs.md".into(),
                seq: 0,
                text: text.into(),
                start: 0,
                end: text.len(),
                heading: None,
                url: url.into(),
                content_hash: docent_index::types::content_hash(text),
            }),
            score: 1.0,
        }
    }

    #[test]
    fn chunk_rendering_quotes_every_line() {
        let chunk = scored("https://docs.example.org/jobs/", "# Jobs\nUse sbatch.");
        assert_eq!(
            render_chunk(&chunk.chunk),
            "Source URL: <https://docs.example.org/jobs/>\n\nExtract:\n> # Jobs\n> Use sbatch.\n\n---\n"
        );
    }

    #[test]
    fn messages_hold_context_then_question() {
        let chunks = vec![scored("a/", "alpha"), scored("b/", "beta")];
        let messages = build_messages("what is alpha?", &chunks, 10_000);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].content.starts_with(SYSTEM_PROMPT));
        assert!(messages[0].content.contains("<a/>"));
        assert!(messages[0].content.contains("<b/>"));
        assert_eq!(messages[1].content, "what is alpha?");
    }

    #[test]
    fn context_budget_keeps_best_chunk() {
        let chunks = vec![scored("a/", &"x".repeat(500)), scored("b/", "beta")];
        let messages = build_messages("q", &chunks, 10);
        assert!(messages[0].content.contains("<a/>"));
        assert!(!messages[0].content.contains("<b/>"));
    }

    #[test]
    fn split_at_first_header() {
        let text = "Use sbatch.\n\nReferences:\n * <https://d/jobs/>\n * <https://d/qos/#limits>\n";
        let (body, urls) = split_references(text);
        assert_eq!(body, "Use sbatch.");
        assert_eq!(urls, vec!["https://d/jobs/", "https://d/qos/#limits"]);
    }

    #[test]
    fn split_accepts_alternative_headers_and_link_styles() {
        let text = "Body.\nSources:\n- [Jobs](https://d/jobs/)\n- see https://d/qos/.\n";
        let (body, urls) = split_references(text);
        assert_eq!(body, "Body.");
        assert_eq!(urls, vec!["https://d/jobs/", "https://d/qos/"]);
    }

    #[test]
    fn split_without_header_takes_trailing_bullets() {
        let text = "Use sbatch.\n * <https://d/jobs/>\n";
        let (body, urls) = split_references(text);
        assert_eq!(body, "Use sbatch.");
        assert_eq!(urls, vec!["https://d/jobs/"]);

        let (body, urls) = split_references("Just an answer.");
        assert_eq!(body, "Just an answer.");
        assert!(urls.is_empty());
    }

    #[test]
    fn validation_drops_invented_urls() {
        let chunks = vec![
            scored("https://d/jobs/#batch", "See <https://d/qos/> for limits."),
            scored("https://d/storage/", "Quotas apply."),
        ];
        let cited = vec![
            "https://d/jobs/#batch".to_owned(),
            "https://d/qos/".to_owned(),
            "https://invented.example/".to_owned(),
            "https://d/jobs/#other".to_owned(),
        ];
        assert_eq!(
            validate_references(&cited, &chunks, false),
            vec!["https://d/jobs/#batch", "https://d/qos/"]
        );
        assert_eq!(
            validate_references(&cited, &chunks, true),
            vec!["https://d/jobs/#batch", "https://d/qos/", "https://d/jobs/#other"]
        );
    }

    #[test]
    fn stem_cuts_last_fragment() {
        assert_eq!(stem_url("https://d/a/#b"), "https://d/a/");
        assert_eq!(stem_url("https://d/a/"), "https://d/a/");
    }

    #[test]
    fn answer_formatting() {
        let refs = vec!["https://d/a/".to_owned(), "https://d/b/".to_owned()];
        assert_eq!(
            format_answer("Body.", &refs),
            "Body.\n\nReferences:\n * <https://d/a/>\n * <https://d/b/>"
        );
        assert_eq!(format_answer("Body.", &[]), "Body.");
    }
}
