//! # Dependency Manifest
//!
//! Parses the `requirements.txt` consumed by the install step. The parser
//! checks the manifest's shape before any build step runs, so a malformed
//! line fails fast with its line number instead of surfacing as an
//! installer error minutes into a build. Version solving is left to the
//! installer; the only semantic check done here is for exact pins on the
//! same package that can never be satisfied together.
//!
//! ## Accepted Lines
//!
//! | Form                             | Entry                      |
//! |----------------------------------|----------------------------|
//! | blank / `# comment`              | skipped                    |
//! | `name[extra]>=1.0,<2 ; marker`   | [`ManifestEntry::Requirement`] |
//! | `name @ https://…`               | [`ManifestEntry::Requirement`] with `url` |
//! | `--index-url …`, `-r other.txt`  | [`ManifestEntry::Option`]  |
//! | `./local/pkg`, `git+https://…`   | [`ManifestEntry::Reference`] |
//!
//! A trailing `\` joins a line with the next one.

use crate::constants::MAX_MANIFEST_SIZE;
use crate::error::{Error, Result};
use crate::storage::sha256_digest;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Version comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierOp {
    /// `===`
    Arbitrary,
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `~=`
    Compatible,
    /// `<=`
    LessEqual,
    /// `>=`
    GreaterEqual,
    /// `<`
    Less,
    /// `>`
    Greater,
}

impl SpecifierOp {
    // Longest operators first so `===` is not read as `==`.
    const ALL: [(&'static str, SpecifierOp); 8] = [
        ("===", SpecifierOp::Arbitrary),
        ("==", SpecifierOp::Equal),
        ("!=", SpecifierOp::NotEqual),
        ("~=", SpecifierOp::Compatible),
        ("<=", SpecifierOp::LessEqual),
        (">=", SpecifierOp::GreaterEqual),
        ("<", SpecifierOp::Less),
        (">", SpecifierOp::Greater),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Arbitrary => "===",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Compatible => "~=",
            Self::LessEqual => "<=",
            Self::GreaterEqual => ">=",
            Self::Less => "<",
            Self::Greater => ">",
        }
    }
}

/// One `op version` clause of a requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionSpecifier {
    pub op: SpecifierOp,
    pub version: String,
}

impl fmt::Display for VersionSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.as_str(), self.version)
    }
}

/// A package requirement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    /// Package name as written.
    pub name: String,
    /// Requested extras.
    pub extras: Vec<String>,
    /// Version clauses; empty means any version.
    pub specifiers: Vec<VersionSpecifier>,
    /// Direct reference (`name @ url`).
    pub url: Option<String>,
    /// Environment marker after `;`, unevaluated.
    pub marker: Option<String>,
    /// Per-requirement installer options (`--hash=…`, `--config-settings …`).
    pub options: Vec<String>,
    /// 1-based line number of the first physical line.
    pub line: usize,
}

impl Requirement {
    /// Returns the normalized project name (lowercase, `-`/`_`/`.` runs → `-`).
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }

    /// Returns the exact version if the requirement is a single `==` pin.
    pub fn pinned_version(&self) -> Option<&str> {
        match self.specifiers.as_slice() {
            [spec] if spec.op == SpecifierOp::Equal && !spec.version.contains('*') => {
                Some(&spec.version)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if !self.extras.is_empty() {
            write!(f, "[{}]", self.extras.join(","))?;
        }
        if let Some(url) = &self.url {
            write!(f, " @ {}", url)?;
        } else {
            let specs: Vec<String> = self.specifiers.iter().map(|s| s.to_string()).collect();
            write!(f, "{}", specs.join(","))?;
        }
        if let Some(marker) = &self.marker {
            write!(f, "; {}", marker)?;
        }
        for option in &self.options {
            write!(f, " {}", option)?;
        }
        Ok(())
    }
}

/// A logical manifest line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestEntry {
    Requirement(Requirement),
    /// Installer option, passed through untouched.
    Option { line: usize, text: String },
    /// Local path or VCS/archive URL.
    Reference { line: usize, target: String },
}

/// A parsed dependency manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
    content: String,
    digest: String,
}

impl Manifest {
    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// - [`Error::ManifestMissing`] if the file does not exist
    /// - [`Error::InvalidManifest`] if it is too large or a line is malformed
    pub fn load(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path).map_err(|_| Error::ManifestMissing {
            path: path.to_path_buf(),
        })?;
        if !meta.is_file() {
            return Err(Error::ManifestMissing {
                path: path.to_path_buf(),
            });
        }
        if meta.len() > MAX_MANIFEST_SIZE {
            return Err(Error::InvalidManifest {
                line: 0,
                reason: format!("manifest exceeds {} bytes", MAX_MANIFEST_SIZE),
            });
        }

        let bytes = fs::read(path)?;
        let content = String::from_utf8(bytes).map_err(|_| Error::InvalidManifest {
            line: 0,
            reason: "manifest is not valid UTF-8".to_string(),
        })?;
        Self::parse(&content)
    }

    /// Parses manifest text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut entries = Vec::new();

        for (line_no, logical) in logical_lines(content) {
            let text = strip_comment(&logical).trim().to_string();
            if text.is_empty() {
                continue;
            }
            entries.push(parse_entry(&text, line_no)?);
        }

        check_conflicting_pins(&entries)?;

        debug!("Parsed manifest: {} entries", entries.len());

        Ok(Self {
            entries,
            content: content.to_string(),
            digest: sha256_digest(content.as_bytes()),
        })
    }

    /// All entries in file order.
    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// Package requirements in file order.
    pub fn requirements(&self) -> impl Iterator<Item = &Requirement> {
        self.entries.iter().filter_map(|e| match e {
            ManifestEntry::Requirement(r) => Some(r),
            _ => None,
        })
    }

    /// Raw manifest text, staged verbatim for the installer.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// Content digest; keys the install step's cache entry.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Returns true if the manifest declares nothing to install.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalizes a project name per the package index naming rules.
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

/// Joins `\` continuations, yielding (first line number, logical line).
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut start = 0usize;

    for (idx, raw) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        if let Some(body) = raw.strip_suffix('\\') {
            current.push_str(body);
            current.push(' ');
            continue;
        }
        current.push_str(raw);
        out.push((start, std::mem::take(&mut current)));
    }
    if !current.is_empty() {
        out.push((start, current));
    }
    out
}

/// Removes a `#` comment that starts the line or follows whitespace.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b'#' && (i == 0 || bytes[i - 1].is_ascii_whitespace()) {
            return &line[..i];
        }
    }
    line
}

fn invalid(line: usize, reason: impl Into<String>) -> Error {
    Error::InvalidManifest {
        line,
        reason: reason.into(),
    }
}

fn parse_entry(text: &str, line: usize) -> Result<ManifestEntry> {
    if text.starts_with('-') {
        let flag = text.split_whitespace().next().unwrap_or(text);
        let valid = flag.len() > 1
            && flag
                .trim_start_matches('-')
                .chars()
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic());
        if !valid {
            return Err(invalid(line, format!("malformed option '{}'", flag)));
        }
        return Ok(ManifestEntry::Option {
            line,
            text: text.to_string(),
        });
    }

    let is_url = text
        .find("://")
        .is_some_and(|idx| !text[..idx].contains('@'));
    if text.starts_with('.') || text.starts_with('/') || is_url {
        return Ok(ManifestEntry::Reference {
            line,
            target: text.to_string(),
        });
    }

    parse_requirement(text, line).map(ManifestEntry::Requirement)
}

fn parse_requirement(text: &str, line: usize) -> Result<Requirement> {
    let (text, options) = split_options(text, line)?;
    let (body, marker) = match text.split_once(';') {
        Some((body, marker)) => {
            let marker = marker.trim();
            if marker.is_empty() {
                return Err(invalid(line, "empty environment marker"));
            }
            (body.trim(), Some(marker.to_string()))
        }
        None => (text.trim(), None),
    };

    let name_end = body
        .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        .unwrap_or(body.len());
    let name = &body[..name_end];
    validate_name(name, line)?;

    let mut rest = body[name_end..].trim_start();

    let mut extras = Vec::new();
    if let Some(after) = rest.strip_prefix('[') {
        let close = after
            .find(']')
            .ok_or_else(|| invalid(line, "unterminated extras"))?;
        for extra in after[..close].split(',') {
            let extra = extra.trim();
            if extra.is_empty() {
                continue;
            }
            validate_name(extra, line)?;
            extras.push(extra.to_string());
        }
        rest = after[close + 1..].trim_start();
    }

    if let Some(url) = rest.strip_prefix('@') {
        let url = url.trim();
        if url.is_empty() || url.contains(char::is_whitespace) {
            return Err(invalid(line, "malformed direct reference"));
        }
        return Ok(Requirement {
            name: name.to_string(),
            extras,
            specifiers: Vec::new(),
            url: Some(url.to_string()),
            marker,
            options,
            line,
        });
    }

    let specifiers = parse_specifiers(rest, line)?;

    Ok(Requirement {
        name: name.to_string(),
        extras,
        specifiers,
        url: None,
        marker,
        options,
        line,
    })
}

/// Splits trailing `--option` tokens off a requirement line.
///
/// A token not starting with `--` is the value of the option before it
/// (`--hash sha256:…`).
fn split_options(text: &str, line: usize) -> Result<(&str, Vec<String>)> {
    let start = text
        .char_indices()
        .find(|&(i, c)| c.is_whitespace() && text[i..].trim_start().starts_with("--"))
        .map(|(i, _)| i);
    let Some(start) = start else {
        return Ok((text, Vec::new()));
    };

    let mut options: Vec<String> = Vec::new();
    for token in text[start..].split_whitespace() {
        if let Some(flag) = token.strip_prefix("--") {
            if !flag.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
                return Err(invalid(line, format!("malformed option '{}'", token)));
            }
            options.push(token.to_string());
        } else if let Some(last) = options.last_mut() {
            last.push(' ');
            last.push_str(token);
        }
    }
    Ok((&text[..start], options))
}

fn validate_name(name: &str, line: usize) -> Result<()> {
    let first = name.chars().next();
    let last = name.chars().last();
    let valid = first.is_some_and(|c| c.is_ascii_alphanumeric())
        && last.is_some_and(|c| c.is_ascii_alphanumeric());
    if !valid {
        if name.is_empty() {
            return Err(invalid(line, "missing package name"));
        }
        return Err(invalid(line, format!("invalid package name '{}'", name)));
    }
    Ok(())
}

fn parse_specifiers(text: &str, line: usize) -> Result<Vec<VersionSpecifier>> {
    let mut text = text.trim();
    if let Some(inner) = text.strip_prefix('(') {
        text = inner
            .strip_suffix(')')
            .ok_or_else(|| invalid(line, "unbalanced parenthesis"))?
            .trim();
    }
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let mut specs = Vec::new();
    for clause in text.split(',') {
        let clause = clause.trim();
        let (op_str, op) = SpecifierOp::ALL
            .iter()
            .find(|(s, _)| clause.starts_with(s))
            .copied()
            .ok_or_else(|| invalid(line, format!("expected version operator in '{}'", clause)))?;
        let version = clause[op_str.len()..].trim();
        validate_version(version, op, line)?;
        specs.push(VersionSpecifier {
            op,
            version: version.to_string(),
        });
    }
    Ok(specs)
}

fn validate_version(version: &str, op: SpecifierOp, line: usize) -> Result<()> {
    if version.is_empty() {
        return Err(invalid(line, format!("missing version after '{}'", op.as_str())));
    }
    if op == SpecifierOp::Arbitrary {
        return if version.contains(char::is_whitespace) {
            Err(invalid(line, "whitespace in version"))
        } else {
            Ok(())
        };
    }
    if !version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '*' | '+' | '!' | '-' | '_'))
    {
        return Err(invalid(line, format!("invalid version '{}'", version)));
    }
    if version.contains('*') && !matches!(op, SpecifierOp::Equal | SpecifierOp::NotEqual) {
        return Err(invalid(
            line,
            format!("wildcard not allowed with '{}'", op.as_str()),
        ));
    }
    Ok(())
}

/// Two different exact pins for one package can never both be satisfied.
fn check_conflicting_pins(entries: &[ManifestEntry]) -> Result<()> {
    let mut pins: HashMap<String, (&str, usize)> = HashMap::new();
    for entry in entries {
        let ManifestEntry::Requirement(req) = entry else {
            continue;
        };
        if req.marker.is_some() {
            continue;
        }
        let Some(version) = req.pinned_version() else {
            continue;
        };
        let key = req.normalized_name();
        if let Some((prev, prev_line)) = pins.get(&key)
            && *prev != version
        {
            return Err(invalid(
                req.line,
                format!(
                    "'{}' pinned to {} conflicts with {} on line {}",
                    req.name, version, prev, prev_line
                ),
            ));
        }
        pins.insert(key, (version, req.line));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pinned_requirement() {
        let manifest = Manifest::parse("requests==2.31.0\n").unwrap();
        let reqs: Vec<_> = manifest.requirements().collect();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].name, "requests");
        assert_eq!(reqs[0].pinned_version(), Some("2.31.0"));
        assert_eq!(reqs[0].line, 1);
    }

    #[test]
    fn test_parse_comments_options_and_continuations() {
        let text = "# deps\n\
                    --index-url https://pypi.org/simple\n\
                    aiogram[fast]>=3.0,<4 \\\n  ; python_version >= \"3.8\"\n\
                    python-dotenv  # env loader\n";
        let manifest = Manifest::parse(text).unwrap();
        assert_eq!(manifest.entries().len(), 3);

        let reqs: Vec<_> = manifest.requirements().collect();
        assert_eq!(reqs[0].name, "aiogram");
        assert_eq!(reqs[0].extras, vec!["fast"]);
        assert_eq!(reqs[0].specifiers.len(), 2);
        assert_eq!(reqs[0].marker.as_deref(), Some("python_version >= \"3.8\""));
        assert_eq!(reqs[0].line, 3);
        assert_eq!(reqs[1].name, "python-dotenv");
        assert!(reqs[1].specifiers.is_empty());
    }

    #[test]
    fn test_direct_reference_and_paths() {
        let text = "pkg @ https://example.com/pkg-1.0.tar.gz\n./vendor/lib\n";
        let manifest = Manifest::parse(text).unwrap();
        let entries = manifest.entries();
        match &entries[0] {
            ManifestEntry::Requirement(r) => {
                assert_eq!(r.url.as_deref(), Some("https://example.com/pkg-1.0.tar.gz"))
            }
            other => panic!("unexpected entry: {:?}", other),
        }
        assert!(matches!(entries[1], ManifestEntry::Reference { .. }));
    }

    #[test]
    fn test_rejects_malformed_lines_with_line_number() {
        let err = Manifest::parse("requests==2.31.0\nfoo=>1\n").unwrap_err();
        match err {
            Error::InvalidManifest { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {}", other),
        }

        assert!(Manifest::parse("requests==\n").is_err());
        assert!(Manifest::parse("--\n").is_err());
        assert!(Manifest::parse("pkg[extra\n").is_err());
        assert!(Manifest::parse("pkg>=1.*\n").is_err());
    }

    #[test]
    fn test_hash_pinned_requirements() {
        let text = "requests==2.31.0 \\\n    --hash=sha256:942c5a758f98d790eaed1a29cb6eefc7ffb0d1cf7af05c3d2791656dbd6ad1e1 \\\n    --hash sha256:58cd2187c01e70e6e26505bca751777aa9f2ee0b7f4300988b709f44e013003f\n\
                    certifi>=2023.7 ; python_version >= \"3.8\" --config-settings=--build-option=--x\n";
        let manifest = Manifest::parse(text).unwrap();
        let reqs: Vec<_> = manifest.requirements().collect();
        assert_eq!(reqs.len(), 2);

        assert_eq!(reqs[0].pinned_version(), Some("2.31.0"));
        assert_eq!(reqs[0].options.len(), 2);
        assert!(reqs[0].options[0].starts_with("--hash=sha256:942c"));
        assert!(reqs[0].options[1].starts_with("--hash sha256:58cd"));

        assert_eq!(reqs[1].specifiers.len(), 1);
        assert_eq!(reqs[1].marker.as_deref(), Some("python_version >= \"3.8\""));
        assert_eq!(reqs[1].options, vec!["--config-settings=--build-option=--x"]);

        assert!(Manifest::parse("requests==2.31.0 --\n").is_err());
    }

    #[test]
    fn test_conflicting_pins_rejected() {
        let err = Manifest::parse("Requests==2.31.0\nrequests==2.30.0\n").unwrap_err();
        assert!(err.to_string().contains("conflicts"));

        assert!(Manifest::parse("requests==2.31.0\nrequests==2.31.0\n").is_ok());
    }

    #[test]
    fn test_digest_tracks_content() {
        let a = Manifest::parse("requests==2.31.0\n").unwrap();
        let b = Manifest::parse("requests==2.31.0\n").unwrap();
        let c = Manifest::parse("requests==2.30.0\n").unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("Python_Dotenv"), "python-dotenv");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
        assert_eq!(normalize_name("a--_b"), "a-b");
    }
}
