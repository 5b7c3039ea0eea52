//! The downloader contract. The actual media fetch is an external
//! collaborator — a real implementation shells out to something like
//! `yt-dlp`. This module only fixes the contract shape and the one piece
//! of retry-predicate logic callers can rely on.

use std::path::Path;

use crate::url_classifier::Platform;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DownloadResult {
    pub file_path: String,
    pub file_size_bytes: u64,
    pub duration_sec: f64,
    pub platform: Platform,
    pub downloaded_at: String,
}

/// Downloads media for a classified URL. Implementations must raise on
/// failure rather than return a partial result.
pub trait Downloader: Send + Sync {
    fn download(
        &self,
        input_url: &str,
        platform: Platform,
        downloads_dir: &Path,
        debug: bool,
    ) -> anyhow::Result<DownloadResult>;
}

/// For platform `x`, a downloader may need to retry with alternate
/// extractor modes when the error matches this pattern (ANSI escapes
/// stripped, case-folded). Exposed so a real downloader (or a test
/// double) can share the exact predicate.
pub fn is_retryable_x_error(message: &str) -> bool {
    let cleaned = strip_ansi_escapes(message).to_ascii_lowercase();
    cleaned.contains("while querying api") && cleaned.contains("dependency: unspecified")
}

fn strip_ansi_escapes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next == 'm' {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_retryable_twitter_dependency_error() {
        let raw = "\u{1b}[31mERROR\u{1b}[0m: while querying api: Dependency: unspecified";
        assert!(is_retryable_x_error(raw));
    }

    #[test]
    fn ignores_unrelated_errors() {
        assert!(!is_retryable_x_error("HTTP Error 404: Not Found"));
    }
}
