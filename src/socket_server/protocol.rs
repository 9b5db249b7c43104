//! Wire format and pluggable request computations
//!
//! A request is one header line naming the subject (usually a file path)
//! followed by zero or more body lines, ended by the client half-closing
//! the stream:
//!
//! ```text
//! foo.txt\n      <- header
//! ab\n           <- body
//! cd\n
//! <EOF>
//! ```
//!
//! The server answers with exactly one `\n`-terminated line produced by a
//! [`Computation`].

use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;
use unicode_general_category::{get_general_category, GeneralCategory};

use crate::fs_utils::check_file_exists;

/// Line terminator used for header, body and response
pub const LINE_TERMINATOR: u8 = b'\n';

/// Line sent to a connection rejected because the registry is full
pub fn capacity_message(active: usize) -> String {
    format!(
        "Sorry, we are currently at full capacity with {} clients. Please try again later.",
        active
    )
}

/// A fully read request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    /// Sanitized header line
    pub subject: String,
    /// Body lines, each re-terminated with `\n`
    pub body: Vec<u8>,
    /// Number of body lines read (a final unterminated line counts)
    pub line_count: usize,
}

impl Request {
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Pure computation applied to a request to produce the response payload.
///
/// The returned bytes must not contain the trailing terminator; the handler
/// appends it. The handler runs `compute` on the blocking pool, so
/// implementations may touch the filesystem.
pub trait Computation: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn compute(&self, request: &Request) -> Vec<u8>;
}

/// Counts Unicode letters (general categories Lu, Ll, Lt, Lm, Lo) in the body
#[derive(Debug, Clone, Copy, Default)]
pub struct LetterCount;

impl Computation for LetterCount {
    fn name(&self) -> &'static str {
        "letters"
    }

    fn compute(&self, request: &Request) -> Vec<u8> {
        let count = request
            .body_text()
            .chars()
            .filter(|c| is_letter(*c))
            .count();
        count.to_string().into_bytes()
    }
}

fn is_letter(c: char) -> bool {
    matches!(
        get_general_category(c),
        GeneralCategory::UppercaseLetter
            | GeneralCategory::LowercaseLetter
            | GeneralCategory::TitlecaseLetter
            | GeneralCategory::ModifierLetter
            | GeneralCategory::OtherLetter
    )
}

/// Echoes the body back without its final terminator
#[derive(Debug, Clone, Copy, Default)]
pub struct Echo;

impl Computation for Echo {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn compute(&self, request: &Request) -> Vec<u8> {
        let body = request.body.as_slice();
        body.strip_suffix(&[LINE_TERMINATOR])
            .unwrap_or(body)
            .to_vec()
    }
}

/// Reports whether the file named by the header exists on the server
#[derive(Debug, Clone, Copy, Default)]
pub struct FileLookup;

impl Computation for FileLookup {
    fn name(&self) -> &'static str {
        "lookup"
    }

    fn compute(&self, request: &Request) -> Vec<u8> {
        match check_file_exists(Path::new(&request.subject)) {
            Ok(status) => status.into_bytes(),
            Err(e) => format!("File not found in {} filepath: {}", request.subject, e).into_bytes(),
        }
    }
}

/// Selectable computation, as named in config files and on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum ComputationKind {
    /// Count alphabetic characters in the body
    #[default]
    Letters,
    /// Echo the body back
    Echo,
    /// Report whether the header path exists
    Lookup,
}

impl ComputationKind {
    pub fn build(self) -> Arc<dyn Computation> {
        match self {
            ComputationKind::Letters => Arc::new(LetterCount),
            ComputationKind::Echo => Arc::new(Echo),
            ComputationKind::Lookup => Arc::new(FileLookup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(subject: &str, body: &str) -> Request {
        Request {
            subject: subject.to_string(),
            body: body.as_bytes().to_vec(),
            line_count: body.lines().count(),
        }
    }

    #[test]
    fn test_capacity_message_text() {
        assert_eq!(
            capacity_message(3),
            "Sorry, we are currently at full capacity with 3 clients. Please try again later."
        );
    }

    #[test]
    fn test_letter_count() {
        assert_eq!(LetterCount.compute(&request("foo.txt", "ab\ncd\n")), b"4");
        assert_eq!(LetterCount.compute(&request("foo.txt", "")), b"0");
        assert_eq!(LetterCount.compute(&request("x", "a1 b2!\n\n c")), b"3");
    }

    #[test]
    fn test_letter_count_unicode() {
        // é, ß, 日, 本 are letters; digits, punctuation and emoji are not
        assert_eq!(LetterCount.compute(&request("x", "é ß 日本 42 ✓\n")), b"4");
    }

    #[test]
    fn test_letter_count_skips_alphabetic_non_letters() {
        // Roman numeral eight (Nl), ypogegrammeni (Mn) and a Devanagari vowel
        // sign (Mc) are Alphabetic but not letters; only NA (Lo) counts
        let body = "\u{2167}\u{0345}\u{0928}\u{093F}\n";
        assert_eq!(LetterCount.compute(&request("x", body)), b"1");
        // Titlecase and modifier letters do count
        assert_eq!(LetterCount.compute(&request("x", "\u{01C5}\u{02B0}\n")), b"2");
    }

    #[test]
    fn test_letter_count_ignores_header() {
        let a = LetterCount.compute(&request("abcdef", "xy\n"));
        let b = LetterCount.compute(&request("", "xy\n"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_echo_strips_final_terminator_only() {
        assert_eq!(Echo.compute(&request("x", "ab\ncd\n")), b"ab\ncd");
        assert_eq!(Echo.compute(&request("x", "")), b"");
    }

    #[test]
    fn test_file_lookup() {
        let dir = TempDir::new().unwrap();
        let present = dir.path().join("here.txt");
        std::fs::write(&present, "data").unwrap();

        let found = FileLookup.compute(&request(present.to_str().unwrap(), ""));
        assert!(String::from_utf8(found).unwrap().starts_with("File exists in"));

        let missing = dir.path().join("gone.txt");
        let not_found = FileLookup.compute(&request(missing.to_str().unwrap(), ""));
        assert!(String::from_utf8(not_found).unwrap().starts_with("File not found in"));
    }

    #[test]
    fn test_kind_builds_matching_computation() {
        assert_eq!(ComputationKind::Letters.build().name(), "letters");
        assert_eq!(ComputationKind::Echo.build().name(), "echo");
        assert_eq!(ComputationKind::Lookup.build().name(), "lookup");
    }
}
