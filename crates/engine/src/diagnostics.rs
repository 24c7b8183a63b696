// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Diagnostic extraction from build output

use kiln_core::{ErrorFormatId, IdSeq, LogStream, ObserverId};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

const ENTERING_DIRECTORY_BEGIN: &str = "Entering directory '";
const ENTERING_DIRECTORY_END: &str = "'";
const FORTIFY_WARNING: &str = "#warning _FORTIFY_SOURCE requires compiling with optimization";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Ignored,
    Note,
    Deprecated,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    /// Classify a `level` capture. Unknown levels are warnings.
    pub fn parse(level: Option<&str>) -> Severity {
        let Some(level) = level else {
            return Severity::Warning;
        };
        let lower = level.to_lowercase();
        [
            ("fatal", Severity::Fatal),
            ("error", Severity::Error),
            ("warning", Severity::Warning),
            ("ignored", Severity::Ignored),
            ("deprecated", Severity::Deprecated),
            ("note", Severity::Note),
        ]
        .into_iter()
        .find(|(needle, _)| lower.contains(needle))
        .map_or(Severity::Warning, |(_, severity)| severity)
    }

    pub fn is_error(self) -> bool {
        matches!(self, Severity::Error | Severity::Fatal)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Ignored => "ignored",
            Severity::Note => "note",
            Severity::Deprecated => "deprecated",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal error",
        })
    }
}

/// A compiler message located in a source file. Line and column are 0-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
    pub severity: Severity,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}: {}: {}",
            self.file.display(),
            self.line + 1,
            self.column + 1,
            self.severity,
            self.message
        )
    }
}

/// Remove ANSI escape sequences (CSI `ESC [ ... final` and two-byte `ESC x`).
pub fn strip_color_codes(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('[') => {
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            Some(_) | None => {}
        }
    }
    out
}

/// Stateful matcher turning log lines into diagnostics.
pub struct DiagnosticExtractor {
    srcdir: PathBuf,
    builddir: PathBuf,
    formats: Vec<(ErrorFormatId, Regex)>,
    current_dir: Option<String>,
    top_dir: Option<String>,
}

impl DiagnosticExtractor {
    pub fn new(srcdir: impl Into<PathBuf>, builddir: impl Into<PathBuf>) -> Self {
        Self {
            srcdir: srcdir.into(),
            builddir: builddir.into(),
            formats: Vec::new(),
            current_dir: None,
            top_dir: None,
        }
    }

    pub fn add_format(&mut self, id: ErrorFormatId, regex: Regex) {
        self.formats.push((id, regex));
    }

    pub fn remove_format(&mut self, id: ErrorFormatId) -> bool {
        let before = self.formats.len();
        self.formats.retain(|(fid, _)| *fid != id);
        self.formats.len() != before
    }

    /// Forget directory tracking from a previous run.
    pub fn reset(&mut self) {
        self.current_dir = None;
        self.top_dir = None;
    }

    pub fn observe(&mut self, stream: LogStream, line: &str, check_stdout: bool) -> Option<Diagnostic> {
        let filtered = strip_color_codes(line);

        if stream == LogStream::Stdout && self.track_directory(&filtered) {
            return None;
        }
        if stream == LogStream::Stderr || check_stdout {
            return self
                .formats
                .iter()
                .find_map(|(_, regex)| regex.captures(&filtered).and_then(|c| self.create(&c)));
        }
        None
    }

    fn track_directory(&mut self, line: &str) -> bool {
        let Some(start) = line.find(ENTERING_DIRECTORY_BEGIN) else {
            return false;
        };
        let rest = &line[start + ENTERING_DIRECTORY_BEGIN.len()..];
        let Some(dir) = rest.strip_suffix(ENTERING_DIRECTORY_END) else {
            return false;
        };
        let builddir = self.builddir.to_string_lossy();
        let dir = dir
            .strip_prefix(&*builddir)
            .map(|d| d.trim_start_matches('/'))
            .unwrap_or(dir);
        if !dir.is_empty() {
            self.current_dir = Some(dir.to_string());
            if self.top_dir.is_none() {
                self.top_dir = Some(dir.to_string());
            }
        }
        true
    }

    fn create(&self, caps: &regex::Captures<'_>) -> Option<Diagnostic> {
        let message = caps.name("message")?.as_str();
        if message.starts_with(FORTIFY_WARNING) {
            return None;
        }
        let filename = caps.name("filename")?.as_str();
        let line = parse_position(caps.name("line").map(|m| m.as_str()))?;
        let column = parse_position(caps.name("column").map(|m| m.as_str()))?;
        let severity = Severity::parse(caps.name("level").map(|m| m.as_str()));

        Some(Diagnostic {
            file: self.resolve(filename),
            line,
            column,
            severity,
            message: message.to_string(),
        })
    }

    fn resolve(&self, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let joined = match (&self.current_dir, &self.top_dir) {
            (Some(current), top) => {
                let base = top
                    .as_deref()
                    .and_then(|t| current.strip_prefix(t))
                    .map(|b| b.trim_start_matches('/'))
                    .unwrap_or(current.as_str());
                Path::new(base).join(path)
            }
            (None, _) => self.builddir.join(path),
        };
        if joined.is_absolute() {
            joined
        } else {
            self.srcdir.join(joined)
        }
    }
}

/// 1-based position to 0-based. Absent positions are 0; values below 1 reject the match.
fn parse_position(value: Option<&str>) -> Option<u32> {
    match value {
        None => Some(0),
        Some(s) => {
            let n: i64 = s.trim().parse().ok()?;
            if n < 1 || n > i64::from(i32::MAX) {
                return None;
            }
            u32::try_from(n - 1).ok()
        }
    }
}

/// Callback receiving extracted diagnostics.
pub type DiagnosticObserver = Arc<dyn Fn(&Diagnostic) + Send + Sync>;

/// Extractor plus observer registry, fed from the pipeline's log dispatch.
pub(crate) struct Diagnostics {
    extractor: Mutex<DiagnosticExtractor>,
    observers: Mutex<BTreeMap<ObserverId, DiagnosticObserver>>,
    check_stdout: AtomicBool,
    ids: IdSeq,
}

impl Diagnostics {
    pub(crate) fn new(extractor: DiagnosticExtractor) -> Self {
        Self {
            extractor: Mutex::new(extractor),
            observers: Mutex::new(BTreeMap::new()),
            check_stdout: AtomicBool::new(false),
            ids: IdSeq::new(),
        }
    }

    pub(crate) fn add_format(&self, regex: Regex) -> ErrorFormatId {
        let id = self.ids.next();
        self.extractor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .add_format(id, regex);
        id
    }

    pub(crate) fn remove_format(&self, id: ErrorFormatId) -> bool {
        self.extractor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove_format(id)
    }

    pub(crate) fn add_observer(&self, observer: DiagnosticObserver) -> ObserverId {
        let id = self.ids.next();
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, observer);
        id
    }

    pub(crate) fn remove_observer(&self, id: ObserverId) -> bool {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some()
    }

    pub(crate) fn set_check_stdout(&self, check: bool) {
        self.check_stdout.store(check, Ordering::Release);
    }

    pub(crate) fn reset(&self) {
        self.extractor.lock().unwrap_or_else(|e| e.into_inner()).reset();
    }

    pub(crate) fn observe(&self, stream: LogStream, line: &str) {
        let check_stdout = self.check_stdout.load(Ordering::Acquire);
        let diagnostic = self
            .extractor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .observe(stream, line, check_stdout);
        let Some(diagnostic) = diagnostic else {
            return;
        };
        tracing::debug!(diagnostic = %diagnostic, "extracted diagnostic");
        let observers: Vec<DiagnosticObserver> = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for observer in observers {
            observer(&diagnostic);
        }
    }
}

#[cfg(test)]
#[path = "diagnostics_tests.rs"]
mod tests;
