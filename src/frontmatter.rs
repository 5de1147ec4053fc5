//! Extraction of the leading YAML frontmatter block from a markdown file.
//!
//! Only the first `---`-delimited block is ever considered frontmatter.
//! Anything after its closing delimiter — including a code fence in the
//! body that happens to contain a `---` line, e.g. a markdown example
//! showing frontmatter syntax — is just body text.

use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum FrontmatterError {
    #[error("file does not start with a `---` frontmatter delimiter")]
    NoOpeningDelimiter,
    #[error("frontmatter block has no closing `---` delimiter")]
    NoClosingDelimiter,
    #[error("invalid YAML in frontmatter: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("io error rewriting frontmatter: {0}")]
    Io(#[from] std::io::Error),
}

/// Split `content` into its frontmatter YAML text and the remaining body.
pub fn split(content: &str) -> Result<(String, String), FrontmatterError> {
    let mut lines = content.lines();

    match lines.next() {
        Some(first) if first.trim() == "---" => {}
        _ => return Err(FrontmatterError::NoOpeningDelimiter),
    }

    let mut yaml_lines = Vec::new();
    let mut body_lines: Option<Vec<&str>> = None;

    for line in lines {
        if body_lines.is_none() {
            if line.trim() == "---" {
                body_lines = Some(Vec::new());
            } else {
                yaml_lines.push(line);
            }
        } else {
            body_lines.as_mut().unwrap().push(line);
        }
    }

    let body_lines = body_lines.ok_or(FrontmatterError::NoClosingDelimiter)?;
    Ok((yaml_lines.join("\n"), body_lines.join("\n")))
}

/// Parse frontmatter into a typed struct, propagating `split`'s delimiter
/// errors and the deserializer's field errors alike.
pub fn parse<T: serde::de::DeserializeOwned>(content: &str) -> Result<(T, String), FrontmatterError> {
    let (yaml, body) = split(content)?;
    let value: T = serde_yaml::from_str(&yaml)?;
    Ok((value, body))
}

/// Rewrite a single top-level frontmatter key in `path`, leaving every other
/// key and the body untouched. Per spec §9, treated as a critical section:
/// the new content is written to a sibling temp file and renamed over the
/// original, so a crash mid-write never leaves a half-written file.
pub fn set_field(path: &Path, key: &str, value: &str) -> Result<(), FrontmatterError> {
    let content = std::fs::read_to_string(path)?;
    let (yaml, body) = split(&content)?;

    let mut doc: serde_yaml::Value = serde_yaml::from_str(&yaml)?;
    if let serde_yaml::Value::Mapping(ref mut map) = doc {
        map.insert(serde_yaml::Value::String(key.to_string()), serde_yaml::Value::String(value.to_string()));
    }

    let new_yaml = serde_yaml::to_string(&doc)?;
    let new_content = format!("---\n{new_yaml}---\n{body}");

    let tmp_path = path.with_extension("md.tmp");
    std::fs::write(&tmp_path, new_content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
