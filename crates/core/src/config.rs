//! INI-based repository list.
//!
//! Each section names one repository; the working copy lives at
//! `<root>/<section name>`. The section `.` is reserved for global defaults
//! and is currently ignored, as are keys outside any section.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::models::{RepositorySpec, DEFAULT_BRANCH, DEFAULT_REMOTE};

/// Section name reserved for global defaults.
pub const RESERVED_SECTION: &str = ".";

/// The ordered set of repositories to keep updated.
#[derive(Debug, Clone, Default)]
pub struct UpdaterConfig {
    pub repositories: Vec<RepositorySpec>,
}

impl UpdaterConfig {
    /// Load the repository list from an INI file, resolving each section
    /// against `root`.
    pub fn load_from_file<P: AsRef<Path>>(path: P, root: &Path) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents, root)
    }

    /// Parse INI text into an ordered repository list. Values are taken as
    /// written (backslashes are not escapes) and key names ignore case.
    pub fn parse(contents: &str, root: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str_noescape(contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let mut repositories = Vec::new();
        let mut seen_sections = HashSet::new();
        let mut seen_paths: HashMap<PathBuf, String> = HashMap::new();

        for (section, props) in ini.iter() {
            let Some(name) = section else {
                if props.iter().next().is_some() {
                    warn!("ignoring keys outside of any section");
                }
                continue;
            };
            if name == RESERVED_SECTION {
                debug!("skipping reserved section");
                continue;
            }
            if !seen_sections.insert(name.to_string()) {
                return Err(ConfigError::DuplicateSection(name.to_string()));
            }

            let spec = parse_section(name, props, root)?;

            if let Some(first) = seen_paths.get(&spec.local_path) {
                return Err(ConfigError::DuplicateLocalPath {
                    path: spec.local_path.display().to_string(),
                    first: first.clone(),
                    second: name.to_string(),
                });
            }
            seen_paths.insert(spec.local_path.clone(), name.to_string());

            debug!(name, path = %spec.local_path.display(), "loaded repository");
            repositories.push(spec);
        }

        info!(count = repositories.len(), "configuration parsed");
        Ok(Self { repositories })
    }

    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}

fn parse_section(
    name: &str,
    props: &ini::Properties,
    root: &Path,
) -> Result<RepositorySpec, ConfigError> {
    let url = get(props, "url")
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ConfigError::MissingField {
            section: name.into(),
            field: "url".into(),
        })?;

    let branch = non_empty_or(get(props, "branch"), DEFAULT_BRANCH);
    let remote = non_empty_or(get(props, "remote"), DEFAULT_REMOTE);

    let force_update = match get(props, "force") {
        Some(raw) => parse_bool(raw).ok_or_else(|| ConfigError::InvalidValue {
            section: name.into(),
            field: "force".into(),
            detail: format!("'{}' is not a boolean", raw),
        })?,
        None => false,
    };

    let min_interval = match get(props, "interval").map(str::trim) {
        Some(raw) if !raw.is_empty() => {
            let secs = raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
                section: name.into(),
                field: "interval".into(),
                detail: format!("'{}' is not a number of seconds", raw),
            })?;
            Some(Duration::from_secs(secs))
        }
        _ => None,
    };

    Ok(RepositorySpec {
        name: name.to_string(),
        local_path: root.join(name),
        remote_url: url.to_string(),
        remote_name: remote,
        branch,
        force_update,
        min_interval,
    })
}

/// Case-insensitive key lookup.
fn get<'a>(props: &'a ini::Properties, key: &str) -> Option<&'a str> {
    props
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}

fn non_empty_or(value: Option<&str>, default: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => default.to_string(),
    }
}

/// INI-style boolean: `1/yes/true/on` and `0/no/false/off`.
fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}
