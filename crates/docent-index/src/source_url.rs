//! Public URLs for documents and their sections.

use url::Url;

use crate::error::{IndexError, Result};

/// Maps relative document paths to the URL readers should follow.
#[derive(Debug, Clone, Default)]
pub struct SourceUrls {
    base: Option<Url>,
}

impl SourceUrls {
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `base` is not an absolute URL.
    pub fn new(base: Option<&str>) -> Result<Self> {
        let base = match base {
            Some(raw) if !raw.trim().is_empty() => {
                let mut raw = raw.trim().to_owned();
                if !raw.ends_with('/') {
                    raw.push('/');
                }
                Some(
                    Url::parse(&raw)
                        .map_err(|e| IndexError::InvalidConfig(format!("base_url {raw}: {e}")))?,
                )
            }
            _ => None,
        };
        Ok(Self { base })
    }

    /// URL of a whole document: `index.md` maps to its directory and a
    /// trailing `.md` becomes `/`.
    #[must_use]
    pub fn document_url(&self, rel_path: &str) -> String {
        let page = page_path(rel_path);
        match &self.base {
            Some(base) => base
                .join(&format!("./{page}"))
                .map_or_else(|_| format!("{base}{page}"), String::from),
            None => page,
        }
    }

    /// URL of a section, with the heading's anchor as fragment.
    #[must_use]
    pub fn section_url(&self, rel_path: &str, heading: Option<&str>) -> String {
        let url = self.document_url(rel_path);
        match heading.map(heading_anchor) {
            Some(anchor) if !anchor.is_empty() => format!("{url}#{anchor}"),
            _ => url,
        }
    }
}

fn page_path(rel_path: &str) -> String {
    if rel_path == "index.md" {
        String::new()
    } else if let Some(dir) = rel_path.strip_suffix("/index.md") {
        format!("{dir}/")
    } else if let Some(stem) = rel_path.strip_suffix(".md") {
        format!("{stem}/")
    } else {
        rel_path.to_owned()
    }
}

/// Anchor generated by static site generators for a heading: lowercase,
/// characters outside `[a-z0-9- ]` dropped, spaces replaced by dashes.
#[must_use]
pub fn heading_anchor(heading: &str) -> String {
    heading
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-' || *c == ' ')
        .collect::<String>()
        .trim()
        .replace(' ', "-")
}
