// FileCommandManager: the file-based protocol steps use to hand environment
// variables, search-path entries, outputs, state and summaries back to the
// engine (GITHUB_ENV, GITHUB_PATH, GITHUB_OUTPUT, GITHUB_STATE,
// GITHUB_STEP_SUMMARY).

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use localrunner_common::constants::{file_commands, LINE_SEPARATOR, MAX_STEP_SUMMARY_SIZE_KB};

use crate::errors::{ProtocolErrorKind, ProtocolParseError, StepError};

const BOM: char = '\u{feff}';

/// Everything one unit wrote to its file-command files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileCommandUpdates {
    pub env: BTreeMap<String, String>,
    /// Entries to prepend, in file order.
    pub path: Vec<String>,
    pub outputs: BTreeMap<String, String>,
    pub state: BTreeMap<String, String>,
    pub summary: Option<String>,
    /// Non-fatal problems (e.g. an oversized summary).
    pub warnings: Vec<String>,
}

impl FileCommandUpdates {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
            && self.path.is_empty()
            && self.outputs.is_empty()
            && self.state.is_empty()
            && self.summary.is_none()
    }
}

/// Fresh, empty backing files for one unit of work.
///
/// The files live in an owned temporary directory that is removed when the
/// set is dropped, whichever way the unit ended.
#[derive(Debug)]
pub struct FileCommandSet {
    directory: TempDir,
    files: BTreeMap<&'static str, PathBuf>,
}

impl FileCommandSet {
    pub fn create(temp_root: &Path) -> io::Result<Self> {
        fs::create_dir_all(temp_root)?;
        let directory = tempfile::Builder::new()
            .prefix("_runner_file_commands_")
            .tempdir_in(temp_root)?;

        let mut files = BTreeMap::new();
        for &name in file_commands::ALL {
            let path = directory.path().join(name.to_lowercase());
            fs::write(&path, "")?;
            files.insert(name, path);
        }

        Ok(Self { directory, files })
    }

    /// Directory holding the files; also usable as the unit's scratch space.
    pub fn directory(&self) -> &Path {
        self.directory.path()
    }

    pub fn path(&self, name: &str) -> Option<&Path> {
        self.files.get(name).map(PathBuf::as_path)
    }

    /// `GITHUB_*` variables pointing at the files.
    pub fn environment(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(name, path)| (name.to_string(), path.to_string_lossy().into_owned()))
            .collect()
    }

    /// Read and parse every file.
    pub fn collect(&self) -> Result<FileCommandUpdates, StepError> {
        let mut updates = FileCommandUpdates::default();

        for (&name, path) in &self.files {
            if name == file_commands::STEP_SUMMARY {
                Self::collect_summary(path, &mut updates)?;
                continue;
            }

            let content = read_file(path)?;
            match name {
                file_commands::ENV => updates.env = collapse(parse_key_value_file(name, &content)?),
                file_commands::OUTPUT => {
                    updates.outputs = collapse(parse_key_value_file(name, &content)?)
                }
                file_commands::STATE => {
                    updates.state = collapse(parse_key_value_file(name, &content)?)
                }
                file_commands::PATH => updates.path = parse_path_file(&content),
                _ => {}
            }
        }

        Ok(updates)
    }

    fn collect_summary(path: &Path, updates: &mut FileCommandUpdates) -> Result<(), StepError> {
        let size = match fs::metadata(path) {
            Ok(metadata) => metadata.len() as usize,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StepError::Runtime(
                    anyhow::Error::new(e).context("Failed to inspect step summary file"),
                ))
            }
        };

        if size == 0 {
            return Ok(());
        }
        if size > MAX_STEP_SUMMARY_SIZE_KB * 1024 {
            updates.warnings.push(format!(
                "$GITHUB_STEP_SUMMARY upload aborted, supports content up to a size of {MAX_STEP_SUMMARY_SIZE_KB}k, got {}k.",
                size / 1024
            ));
            return Ok(());
        }

        let content = read_file(path)?;
        let content = content.strip_prefix(BOM).unwrap_or(&content);
        if !content.trim().is_empty() {
            updates.summary = Some(content.to_string());
        }
        Ok(())
    }
}

fn read_file(path: &Path) -> Result<String, StepError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        // a step may delete its own file; that is the same as writing nothing
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(StepError::Runtime(
            anyhow::Error::new(e).context(format!("Failed to read file command {}", path.display())),
        )),
    }
}

fn collapse(pairs: Vec<(String, String)>) -> BTreeMap<String, String> {
    // later assignments replace earlier ones
    pairs.into_iter().collect()
}

/// Parse the `KEY=VALUE` / `KEY<<DELIM` format shared by the env, output and
/// state files. Returns assignments in file order.
pub fn parse_key_value_file(file: &str, content: &str) -> Result<Vec<(String, String)>, ProtocolParseError> {
    let content = content.strip_prefix(BOM).unwrap_or(content);
    let error = |line: usize, kind: ProtocolErrorKind| ProtocolParseError {
        file: file.to_string(),
        line,
        kind,
    };

    let mut pairs = Vec::new();
    let mut lines = content.lines().enumerate();

    while let Some((index, line)) = lines.next() {
        let line_number = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let equals = line.find('=');
        let heredoc = line.find("<<");

        match (equals, heredoc) {
            (Some(eq), hd) if hd.map_or(true, |hd| eq < hd) => {
                let key = &line[..eq];
                if key.trim().is_empty() {
                    return Err(error(line_number, ProtocolErrorKind::EmptyKey));
                }
                pairs.push((key.to_string(), line[eq + 1..].to_string()));
            }
            (_, Some(hd)) => {
                let key = &line[..hd];
                let delimiter = &line[hd + 2..];
                if key.trim().is_empty() {
                    return Err(error(line_number, ProtocolErrorKind::EmptyKey));
                }
                if delimiter.is_empty() {
                    return Err(error(line_number, ProtocolErrorKind::EmptyDelimiter));
                }

                let mut value = Vec::new();
                let mut terminated = false;
                for (_, body) in lines.by_ref() {
                    if body == delimiter {
                        terminated = true;
                        break;
                    }
                    value.push(body);
                }
                if !terminated {
                    return Err(error(
                        line_number,
                        ProtocolErrorKind::MissingDelimiter(delimiter.to_string()),
                    ));
                }

                pairs.push((key.to_string(), value.join(LINE_SEPARATOR)));
            }
            _ => {
                return Err(error(line_number, ProtocolErrorKind::InvalidLine(line.to_string())));
            }
        }
    }

    Ok(pairs)
}

/// Parse the path file: one entry per non-empty line, in file order.
pub fn parse_path_file(content: &str) -> Vec<String> {
    let content = content.strip_prefix(BOM).unwrap_or(content);
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
