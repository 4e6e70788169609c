//! OpenSSH client config: rewrite one `Host` block, discover aliases.
//!
//! The writer keeps every line it does not own byte-for-byte, so a user's
//! hand-written config survives repeated `podlift up` runs. The reader
//! follows `Include` the way `ssh` does, to list the aliases a transfer can
//! target.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::error::PodliftError;
use crate::provider::Endpoint;
use crate::util::{atomic_write, expand_home};

const MAX_INCLUDE_DEPTH: usize = 16;

/// One `Host` block written by podlift.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub alias: String,
    pub host_name: String,
    pub port: u16,
    pub user: String,
    /// Written as given; `ssh` expands `~` itself.
    pub identity_file: Option<String>,
}

impl HostEntry {
    pub fn new(alias: &str, endpoint: &Endpoint, user: &str, identity_file: Option<&str>) -> Self {
        Self {
            alias: alias.to_string(),
            host_name: endpoint.host.clone(),
            port: endpoint.port,
            user: user.to_string(),
            identity_file: identity_file
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }
    }

    /// The block text, newline-terminated.
    pub fn render(&self) -> String {
        let mut out = format!("Host {}\n", self.alias);
        let _ = writeln!(out, "    HostName {}", self.host_name);
        let _ = writeln!(out, "    User {}", self.user);
        let _ = writeln!(out, "    Port {}", self.port);
        if let Some(identity) = &self.identity_file {
            let _ = writeln!(out, "    IdentityFile {identity}");
        }
        out.push_str("    StrictHostKeyChecking no\n");
        out.push_str("    UserKnownHostsFile /dev/null\n");
        out.push_str("    ConnectTimeout 10\n");
        out.push_str("    ServerAliveInterval 30\n");
        out
    }
}

// ── parsing ─────────────────────────────────────────────────────────

/// Split a config line into its keyword and argument text.
///
/// Keywords are separated from arguments by whitespace and/or one `=`.
/// Comments and blank lines yield `None`.
fn split_directive(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let keyword = &line[..end];
    let rest = line[end..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim();
    Some((keyword, rest))
}

/// Whitespace-separated arguments; double quotes group words.
fn split_args(rest: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut has_token = false;
    for c in rest.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                has_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BlockKind {
    Host(Vec<String>),
    Match,
}

#[derive(Debug, Clone)]
struct Block {
    kind: BlockKind,
    /// Header line as written, followed by the body lines.
    lines: Vec<String>,
}

/// A config file as lines before the first block plus the blocks in order.
#[derive(Debug, Clone, Default)]
pub struct ConfigDocument {
    preamble: Vec<String>,
    blocks: Vec<Block>,
}

impl ConfigDocument {
    pub fn parse(text: &str) -> Self {
        let mut doc = ConfigDocument::default();
        for line in text.lines() {
            let header = split_directive(line).and_then(|(keyword, rest)| {
                if keyword.eq_ignore_ascii_case("host") {
                    Some(BlockKind::Host(split_args(rest)))
                } else if keyword.eq_ignore_ascii_case("match") {
                    Some(BlockKind::Match)
                } else {
                    None
                }
            });
            match (header, doc.blocks.last_mut()) {
                (Some(kind), _) => doc.blocks.push(Block {
                    kind,
                    lines: vec![line.to_string()],
                }),
                (None, Some(block)) => block.lines.push(line.to_string()),
                (None, None) => doc.preamble.push(line.to_string()),
            }
        }
        doc
    }

    /// `Host` patterns in file order, including wildcards and negations.
    pub fn host_patterns(&self) -> impl Iterator<Item = &str> {
        self.blocks.iter().flat_map(|b| match &b.kind {
            BlockKind::Host(patterns) => patterns.iter().map(String::as_str).collect(),
            BlockKind::Match => Vec::new(),
        })
    }

    /// Top-level `Include` arguments, plus those inside blocks.
    fn include_args(&self) -> Vec<String> {
        self.preamble
            .iter()
            .chain(self.blocks.iter().flat_map(|b| b.lines.iter().skip(1)))
            .filter_map(|line| split_directive(line))
            .filter(|(keyword, _)| keyword.eq_ignore_ascii_case("include"))
            .flat_map(|(_, rest)| split_args(rest))
            .collect()
    }

    /// Remove `alias` everywhere. Blocks naming only the alias disappear;
    /// blocks that also name other patterns keep those.
    pub fn remove_alias(&mut self, alias: &str) {
        self.blocks.retain_mut(|block| {
            let BlockKind::Host(patterns) = &mut block.kind else {
                return true;
            };
            if !patterns.iter().any(|p| p == alias) {
                return true;
            }
            patterns.retain(|p| p != alias);
            if patterns.is_empty() {
                return false;
            }
            let indent: String = block.lines[0]
                .chars()
                .take_while(|c| c.is_whitespace())
                .collect();
            block.lines[0] = format!("{indent}Host {}", patterns.join(" "));
            true
        });
    }

    /// Replace any existing block for the entry's alias with a fresh one at
    /// the end of the file.
    pub fn upsert(&mut self, entry: &HostEntry) {
        self.remove_alias(&entry.alias);
        self.blocks.push(Block {
            kind: BlockKind::Host(vec![entry.alias.clone()]),
            lines: entry.render().lines().map(str::to_string).collect(),
        });
    }

    /// Serialize. Trailing blank lines before the last block collapse to one
    /// separator, which keeps repeated upserts byte-identical.
    pub fn render(&self) -> String {
        let mut lines: Vec<&str> = self.preamble.iter().map(String::as_str).collect();
        let (last, rest) = match self.blocks.split_last() {
            Some((last, rest)) => (Some(last), rest),
            None => (None, &self.blocks[..]),
        };
        for block in rest {
            lines.extend(block.lines.iter().map(String::as_str));
        }

        let Some(last) = last else {
            return join_lines(&lines);
        };
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
        if !lines.is_empty() {
            lines.push("");
        }
        lines.extend(last.lines.iter().map(String::as_str));
        join_lines(&lines)
    }
}

fn join_lines(lines: &[&str]) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push('\n');
    }
    out
}

// ── write path ──────────────────────────────────────────────────────

/// Atomically replace the block for `entry.alias` in `path`, creating the
/// file (mode 0600) and its directory (mode 0700) when missing.
///
/// Returns notes about earlier settings that override the new block; they
/// are also logged.
pub fn write_host_entry(path: &Path, entry: &HostEntry) -> Result<Vec<String>, PodliftError> {
    let existing = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            create_private_dir(path)?;
            String::new()
        }
        Err(e) => {
            return Err(PodliftError::SshConfig {
                path: path.display().to_string(),
                message: format!("cannot read: {e}"),
            });
        }
    };

    let mut doc = ConfigDocument::parse(&existing);
    doc.upsert(entry);
    let notes = shadowing_notes(path, &doc, &entry.alias);
    for note in &notes {
        tracing::warn!(path = %path.display(), alias = %entry.alias, "{note}");
    }

    let rendered = doc.render();
    if rendered == existing {
        tracing::debug!(path = %path.display(), alias = %entry.alias, "ssh config already up to date");
        return Ok(notes);
    }
    atomic_write(path, rendered.as_bytes(), 0o600)?;
    tracing::info!(path = %path.display(), alias = %entry.alias, host = %entry.host_name, port = entry.port, "wrote ssh host block");
    Ok(notes)
}

/// Directives whose first value decides where `ssh <alias>` connects.
const CONNECTION_KEYWORDS: [&str; 4] = ["hostname", "user", "port", "identityfile"];

/// Settings that `ssh` reads before the (last) block for `alias` and that
/// therefore win over it: wildcard blocks matching the alias, and the alias
/// defined again in an included file.
fn shadowing_notes(path: &Path, doc: &ConfigDocument, alias: &str) -> Vec<String> {
    let mut notes = Vec::new();
    let earlier = doc.blocks.split_last().map(|(_, rest)| rest).unwrap_or(&[]);

    for block in earlier {
        let BlockKind::Host(patterns) = &block.kind else {
            continue;
        };
        let matches = patterns.iter().any(|p| {
            !p.starts_with('!')
                && p.contains(['*', '?'])
                && glob::Pattern::new(p).is_ok_and(|pat| pat.matches(alias))
        });
        if !matches {
            continue;
        }
        let keys: Vec<&str> = block.lines[1..]
            .iter()
            .filter_map(|line| split_directive(line))
            .map(|(keyword, _)| keyword)
            .filter(|k| CONNECTION_KEYWORDS.iter().any(|c| k.eq_ignore_ascii_case(c)))
            .collect();
        if !keys.is_empty() {
            notes.push(format!(
                "`{}` in {} sets {} before Host {alias}; those values take precedence",
                block.lines[0].trim(),
                path.display(),
                keys.join(", ")
            ));
        }
    }

    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    for arg in doc.include_args() {
        for file in resolve_include(&arg, &base) {
            let Ok(text) = std::fs::read_to_string(&file) else {
                continue;
            };
            let mut aliases = Vec::new();
            visit(&text, &base, 1, &mut aliases);
            if aliases.iter().any(|a| a == alias) {
                notes.push(format!(
                    "{} also defines Host {alias}; remove it there or it overrides this block",
                    file.display()
                ));
            }
        }
    }

    notes
}

fn create_private_dir(path: &Path) -> Result<(), PodliftError> {
    let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) else {
        return Ok(());
    };
    if dir.exists() {
        return Ok(());
    }
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder.create(dir).map_err(|e| PodliftError::Io {
        context: format!("creating {}", dir.display()),
        source: e,
    })
}

// ── read path ───────────────────────────────────────────────────────

/// Concrete aliases defined in `path` and everything it includes, in
/// first-seen order without duplicates.
///
/// Relative `Include` paths resolve against the directory of `path`.
pub fn collect_aliases(path: &Path) -> Result<Vec<String>, PodliftError> {
    let text = std::fs::read_to_string(path).map_err(|e| PodliftError::SshConfig {
        path: path.display().to_string(),
        message: format!("cannot read: {e}"),
    })?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut aliases = Vec::new();
    visit(&text, &base, 0, &mut aliases);
    Ok(aliases)
}

fn visit(text: &str, base: &Path, depth: usize, aliases: &mut Vec<String>) {
    let doc = ConfigDocument::parse(text);
    for pattern in doc.host_patterns() {
        if is_concrete(pattern) && !aliases.iter().any(|a| a == pattern) {
            aliases.push(pattern.to_string());
        }
    }

    for arg in doc.include_args() {
        if depth + 1 > MAX_INCLUDE_DEPTH {
            tracing::warn!(include = %arg, "ssh config includes nested too deeply, skipping");
            continue;
        }
        for file in resolve_include(&arg, base) {
            match std::fs::read_to_string(&file) {
                Ok(included) => visit(&included, base, depth + 1, aliases),
                Err(e) => tracing::warn!(path = %file.display(), error = %e, "skipping unreadable ssh config include"),
            }
        }
    }
}

fn is_concrete(pattern: &str) -> bool {
    !pattern.is_empty() && !pattern.starts_with('!') && !pattern.contains(['*', '?'])
}

/// Expand `~`, anchor relative paths at `base`, expand globs (sorted).
fn resolve_include(arg: &str, base: &Path) -> Vec<PathBuf> {
    let expanded = expand_home(arg);
    let path = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };

    let pattern = path.to_string_lossy();
    if !pattern.contains(['*', '?', '[']) {
        return vec![path];
    }
    match glob::glob(&pattern) {
        Ok(paths) => {
            let mut files: Vec<PathBuf> = paths
                .filter_map(|entry| match entry {
                    Ok(p) => Some(p),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable ssh config include");
                        None
                    }
                })
                .filter(|p| p.is_file())
                .collect();
            files.sort();
            files
        }
        Err(e) => {
            tracing::warn!(pattern = %pattern, error = %e, "invalid Include pattern");
            Vec::new()
        }
    }
}

// ── selection ───────────────────────────────────────────────────────

/// Choose the transfer target.
///
/// An explicit alias always wins. Otherwise exactly one discovered alias is
/// required; callers that can prompt handle the ambiguous case themselves.
pub fn select_alias(
    aliases: &[String],
    explicit: Option<&str>,
    source: &Path,
) -> Result<String, PodliftError> {
    if let Some(alias) = explicit {
        if !aliases.iter().any(|a| a == alias) {
            tracing::warn!(alias, "host is not defined in the ssh config; passing it to ssh as-is");
        }
        return Ok(alias.to_string());
    }
    match aliases {
        [] => Err(PodliftError::NoHostConfigured {
            path: source.display().to_string(),
        }),
        [only] => Ok(only.clone()),
        _ => Err(PodliftError::AmbiguousHostSelection {
            aliases: aliases.to_vec(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(host: &str, port: u16) -> HostEntry {
        HostEntry::new(
            "vast-ai-dev",
            &Endpoint {
                host: host.into(),
                port,
            },
            "root",
            Some("~/.ssh/id_ed25519"),
        )
    }

    const EXISTING: &str = "\
# personal hosts
Include config.d/*

Host github.com
    User git
    IdentityFile ~/.ssh/github

Host vast-ai-dev
    HostName 198.51.100.1
    Port 1111

Match host *.internal
    ProxyJump bastion

Host *
    ServerAliveInterval 60
";

    #[test]
    fn render_block() {
        assert_eq!(
            entry("203.0.113.9", 40122).render(),
            "Host vast-ai-dev\n    HostName 203.0.113.9\n    User root\n    Port 40122\n    \
             IdentityFile ~/.ssh/id_ed25519\n    StrictHostKeyChecking no\n    \
             UserKnownHostsFile /dev/null\n    ConnectTimeout 10\n    ServerAliveInterval 30\n"
        );
    }

    #[test]
    fn directive_separators() {
        assert_eq!(split_directive("  Host=a b"), Some(("Host", "a b")));
        assert_eq!(split_directive("HOST  =  a"), Some(("HOST", "a")));
        assert_eq!(split_directive("\tInclude ~/x"), Some(("Include", "~/x")));
        assert_eq!(split_directive("# Host x"), None);
        assert_eq!(split_directive("   "), None);
    }

    #[test]
    fn quoted_args() {
        assert_eq!(split_args(r#"a "b c" d"#), vec!["a", "b c", "d"]);
        assert_eq!(split_args(""), Vec::<String>::new());
    }

    #[test]
    fn upsert_replaces_and_keeps_order() {
        let mut doc = ConfigDocument::parse(EXISTING);
        doc.upsert(&entry("203.0.113.9", 40122));
        let out = doc.render();

        assert_eq!(out.matches("Host vast-ai-dev").count(), 1);
        assert!(!out.contains("198.51.100.1"));
        let github = out.find("Host github.com").unwrap();
        let matcher = out.find("Match host *.internal").unwrap();
        let star = out.find("Host *\n").unwrap();
        let ours = out.find("Host vast-ai-dev").unwrap();
        assert!(github < matcher && matcher < star && star < ours);
        assert!(out.starts_with("# personal hosts\nInclude config.d/*\n"));
        assert!(out.contains("    IdentityFile ~/.ssh/github\n"));
    }

    #[test]
    fn double_write_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, EXISTING).unwrap();

        write_host_entry(&path, &entry("203.0.113.9", 40122)).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();
        write_host_entry(&path, &entry("203.0.113.9", 40122)).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn second_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, EXISTING).unwrap();

        write_host_entry(&path, &entry("203.0.113.9", 40122)).unwrap();
        write_host_entry(&path, &entry("192.0.2.44", 22)).unwrap();
        let out = std::fs::read_to_string(&path).unwrap();
        assert_eq!(out.matches("Host vast-ai-dev\n").count(), 1);
        assert!(out.ends_with(&entry("192.0.2.44", 22).render()));
        assert!(!out.contains("203.0.113.9"));
        assert!(out.contains("Host github.com\n    User git\n"));
    }

    #[test]
    fn unrelated_wildcard_is_not_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, EXISTING).unwrap();
        let notes = write_host_entry(&path, &entry("203.0.113.9", 40122)).unwrap();
        assert!(notes.is_empty(), "{notes:?}");
    }

    #[test]
    fn leading_wildcard_with_user_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host *\n    User ubuntu\n    Port 2222\n\nHost *.corp\n    User corp\n").unwrap();

        let notes = write_host_entry(&path, &entry("203.0.113.9", 40122)).unwrap();
        assert_eq!(notes.len(), 1, "{notes:?}");
        assert!(notes[0].contains("`Host *`"));
        assert!(notes[0].contains("User, Port"));
        // The block is still appended.
        let out = std::fs::read_to_string(&path).unwrap();
        assert!(out.ends_with(&entry("203.0.113.9", 40122).render()));
    }

    #[test]
    fn alias_in_included_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let conf_d = dir.path().join("config.d");
        std::fs::create_dir(&conf_d).unwrap();
        std::fs::write(conf_d.join("vast-ai-vast-ai-dev"), "Host vast-ai-dev\n    HostName 198.51.100.7\n").unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Include config.d/*\n").unwrap();

        let notes = write_host_entry(&path, &entry("203.0.113.9", 40122)).unwrap();
        assert_eq!(notes.len(), 1, "{notes:?}");
        assert!(notes[0].contains("vast-ai-vast-ai-dev"));
        // The included file is left alone.
        assert!(
            std::fs::read_to_string(conf_d.join("vast-ai-vast-ai-dev"))
                .unwrap()
                .contains("198.51.100.7")
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_config_keeps_link() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("dotfiles-ssh-config");
        std::fs::write(&real, "Host github.com\n    User git\n").unwrap();
        let link = dir.path().join("config");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        write_host_entry(&link, &entry("203.0.113.9", 40122)).unwrap();

        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        let out = std::fs::read_to_string(&real).unwrap();
        assert!(out.starts_with("Host github.com\n"));
        assert!(out.ends_with(&entry("203.0.113.9", 40122).render()));
    }

    #[test]
    fn shared_host_line_keeps_other_patterns() {
        let mut doc = ConfigDocument::parse("  Host other vast-ai-dev third\n    User me\n");
        doc.remove_alias("vast-ai-dev");
        assert_eq!(doc.render(), "  Host other third\n    User me\n");
    }

    #[test]
    fn missing_file_and_dir_created_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssh").join("config");
        write_host_entry(&path, &entry("203.0.113.9", 40122)).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            entry("203.0.113.9", 40122).render()
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
            let dir_mode = std::fs::metadata(path.parent().unwrap())
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(file_mode & 0o777, 0o600);
            assert_eq!(dir_mode & 0o777, 0o700);
        }
    }

    #[test]
    fn aliases_skip_wildcards_and_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host a\nHost b *.corp\nHost a\nHost !c ?x\nHost *\n").unwrap();
        assert_eq!(collect_aliases(&path).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn aliases_follow_includes() {
        let dir = tempfile::tempdir().unwrap();
        let conf_d = dir.path().join("config.d");
        std::fs::create_dir(&conf_d).unwrap();
        std::fs::write(conf_d.join("20-work"), "Host work\n    HostName w\n").unwrap();
        std::fs::write(conf_d.join("10-gpu"), "Host gpu main\nInclude nested\n").unwrap();
        std::fs::write(dir.path().join("nested"), "Host deep\n").unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host main\nInclude config.d/* missing-file\n").unwrap();

        assert_eq!(
            collect_aliases(&path).unwrap(),
            vec!["main", "gpu", "deep", "work"]
        );
    }

    #[test]
    fn include_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config");
        std::fs::write(&path, "Host loop\nInclude config\n").unwrap();
        assert_eq!(collect_aliases(&path).unwrap(), vec!["loop"]);
    }

    #[test]
    fn missing_main_config_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = collect_aliases(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, PodliftError::SshConfig { .. }));
    }

    #[test]
    fn selection_rules() {
        let src = Path::new("/home/u/.ssh/config");
        let one = vec!["a".to_string()];
        let two = vec!["a".to_string(), "b".to_string()];

        assert_eq!(select_alias(&one, None, src).unwrap(), "a");
        assert!(matches!(
            select_alias(&[], None, src),
            Err(PodliftError::NoHostConfigured { .. })
        ));
        match select_alias(&two, None, src) {
            Err(PodliftError::AmbiguousHostSelection { aliases }) => assert_eq!(aliases, two),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(select_alias(&two, Some("b"), src).unwrap(), "b");
        assert_eq!(select_alias(&[], Some("elsewhere"), src).unwrap(), "elsewhere");
    }
}
