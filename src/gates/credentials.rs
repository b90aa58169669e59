//! Credential detection for task content and vault files.

use crate::runtime::VaultPaths;
use regex::Regex;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

/// Named secret formats. Matches are reported masked, never verbatim.
static CREDENTIAL_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("aws_access_key", r"(?i)\b(?:AKIA|ABIA|ACCA|ASIA)[0-9A-Z]{16}\b"),
        (
            "api_token",
            r#"(?i)(?:api[_-]?key|api[_-]?token|apikey)\s*[:=]\s*["']?[\w\-]{20,}"#,
        ),
        ("pem_key", r"-----BEGIN (?:RSA |EC |DSA |OPENSSH )?PRIVATE KEY-----"),
        (
            "password_field",
            r#"(?i)(?:password|passwd|pwd)\s*[:=]\s*["']?[^\s"']{8,}"#,
        ),
        (
            "generic_secret",
            r#"(?i)(?:secret|token|bearer)\s*[:=]\s*["']?[\w\-/.]{20,}"#,
        ),
        (
            "connection_string",
            r"(?i)(?:mongodb|postgres|postgresql|mysql|redis)://\S+:\S+@",
        ),
    ]
    .into_iter()
    .filter_map(|(name, pattern)| Regex::new(pattern).ok().map(|regex| (name, regex)))
    .collect()
});

/// Word-bounded credential vocabulary plus secret-bearing file extensions.
static CREDENTIAL_KEYWORDS: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:passwords?|secrets?|tokens?|api[_-]keys?|private_keys?|access_keys?|credentials?|auth|oauth2?|ssh|certificates?)\b|\.(?:env|pem|key)\b",
    )
    .ok()
});

const SCANNED_FOLDERS: [&str; 3] = [
    crate::runtime::state_paths::NEEDS_ACTION_DIR,
    crate::runtime::state_paths::IN_PROGRESS_DIR,
    crate::runtime::state_paths::DONE_DIR,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFinding {
    /// Pattern name, or `keyword` for vocabulary hits.
    pub pattern: &'static str,
    pub line: usize,
    pub masked: String,
    pub file: Option<String>,
}

impl CredentialFinding {
    pub fn describe(&self) -> String {
        match &self.file {
            Some(file) => format!("{}@{}:{}={}", self.pattern, file, self.line, self.masked),
            None => format!("{}@{}={}", self.pattern, self.line, self.masked),
        }
    }
}

/// Shows the first four and last two characters of a value.
pub fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len();
    if len <= 8 {
        let keep = len.min(2);
        let mut out: String = chars[..keep].iter().collect();
        out.push_str(&"*".repeat(len - keep));
        return out;
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[len - 2..].iter().collect();
    format!("{head}{}{tail}", "*".repeat(len - 6))
}

/// Every pattern match in `text`, one finding per match, lines numbered from 1.
pub fn scan_text(text: &str) -> Vec<CredentialFinding> {
    let mut findings = Vec::new();
    for (index, line) in text.lines().enumerate() {
        for (name, regex) in CREDENTIAL_PATTERNS.iter() {
            for found in regex.find_iter(line) {
                findings.push(CredentialFinding {
                    pattern: name,
                    line: index + 1,
                    masked: mask_value(found.as_str()),
                    file: None,
                });
            }
        }
    }
    findings
}

/// Pattern matches plus credential vocabulary. Used by the admission gate,
/// where a bare mention of a secret is already enough to escalate.
pub fn scan_task_text(text: &str) -> Vec<CredentialFinding> {
    let mut findings = scan_text(text);
    if let Some(keywords) = CREDENTIAL_KEYWORDS.as_ref() {
        for (index, line) in text.lines().enumerate() {
            for found in keywords.find_iter(line) {
                findings.push(CredentialFinding {
                    pattern: "keyword",
                    line: index + 1,
                    masked: found.as_str().to_ascii_lowercase(),
                    file: None,
                });
            }
        }
    }
    findings
}

pub fn scan_file(path: &Path) -> std::io::Result<Vec<CredentialFinding>> {
    let bytes = fs::read(path)?;
    let text = String::from_utf8_lossy(&bytes);
    let file = path.display().to_string();
    Ok(scan_text(&text)
        .into_iter()
        .map(|finding| CredentialFinding {
            file: Some(file.clone()),
            ..finding
        })
        .collect())
}

/// Scans markdown files in the task folders. Unreadable files are skipped.
pub fn scan_vault(paths: &VaultPaths) -> Vec<CredentialFinding> {
    let mut findings = Vec::new();
    for folder in SCANNED_FOLDERS {
        let dir = paths.vault_root.join(folder);
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut files: Vec<_> = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().and_then(|ext| ext.to_str()) == Some("md"))
            .collect();
        files.sort();
        for file in files {
            if let Ok(found) = scan_file(&file) {
                findings.extend(found);
            }
        }
    }
    findings
}
