//! Runtime configuration for collection.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

/// File name patterns that mark a file as a test module.
pub const DEFAULT_PYTHON_FILES: &[&str] = &["test_*.py", "*_test.py"];

/// Directory (and file) name patterns never descended into.
pub const DEFAULT_NORECURSEDIRS: &[&str] = &[
    ".*",
    ".git",
    "__pycache__",
    ".tox",
    ".venv",
    "venv",
    ".eggs",
    "*.egg-info",
    "*.egg",
    "node_modules",
    "build",
    "dist",
];

const DEFAULT_FUNCTION_PREFIX: &str = "test";
const DEFAULT_CLASS_PREFIX: &str = "Test";

/// Cache document location relative to the project root.
const CACHE_RELATIVE_PATH: &[&str] = &[".pytest_cache", "fastcollect", "cache.json"];

const PYPROJECT: &str = "pyproject.toml";

/// Runtime configuration for a collection root.
#[derive(Debug, Clone)]
pub struct Config {
    /// Normalized absolute project root.
    pub root: PathBuf,
    pub python_files: Vec<String>,
    pub norecursedirs: Vec<String>,
    pub function_prefix: String,
    pub class_prefix: String,
    pub use_cache: bool,
    pub use_daemon: bool,
    /// Spawn a background daemon after a local (fallback) pass.
    pub auto_start_daemon: bool,
    /// Report fallbacks at `warn` instead of `debug`.
    pub verbose: bool,
    /// Overrides the default cache document location.
    pub cache_path: Option<PathBuf>,
}

impl Config {
    /// Default configuration for `root`.
    #[must_use]
    pub fn for_root(root: &Path) -> Self {
        Self {
            root: normalize_path(root),
            ..Self::default()
        }
    }

    /// Default configuration for `root`, with `pyproject.toml` overrides applied.
    ///
    /// A missing `pyproject.toml` is not an error; a malformed one is logged and ignored.
    #[must_use]
    pub fn load(root: &Path) -> Self {
        let mut config = Self::for_root(root);
        let path = config.root.join(PYPROJECT);
        match read_project_settings(&path) {
            Ok(Some(settings)) => {
                debug!(path = %path.display(), "applying project settings");
                config.apply(settings);
            }
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), %e, "ignoring unreadable project settings"),
        }
        config
    }

    /// Location of the cache document.
    #[must_use]
    pub fn cache_file(&self) -> PathBuf {
        self.cache_path.clone().unwrap_or_else(|| {
            CACHE_RELATIVE_PATH
                .iter()
                .fold(self.root.clone(), |acc, part| acc.join(part))
        })
    }

    /// Whether a function name follows the test naming convention.
    #[must_use]
    pub fn is_test_function(&self, name: &str) -> bool {
        name.starts_with(&self.function_prefix)
    }

    /// Whether a class name follows the test class naming convention.
    #[must_use]
    pub fn is_test_class(&self, name: &str) -> bool {
        name.starts_with(&self.class_prefix)
    }

    fn apply(&mut self, settings: ProjectSettings) {
        if let Some(pytest) = settings.pytest {
            if let Some(files) = pytest.python_files {
                self.python_files = files.into_vec();
            }
            if let Some(dirs) = pytest.norecursedirs {
                self.norecursedirs = dirs.into_vec();
            }
            if let Some(prefix) = pytest.python_functions.and_then(first_word) {
                self.function_prefix = prefix;
            }
            if let Some(prefix) = pytest.python_classes.and_then(first_word) {
                self.class_prefix = prefix;
            }
        }

        if let Some(own) = settings.fastcollect {
            if let Some(files) = own.python_files {
                self.python_files = files.into_vec();
            }
            if let Some(dirs) = own.norecursedirs {
                self.norecursedirs = dirs.into_vec();
            }
            if let Some(cache) = own.cache {
                self.use_cache = cache;
            }
            if let Some(daemon) = own.daemon {
                self.use_daemon = daemon;
            }
            if let Some(auto) = own.auto_start_daemon {
                self.auto_start_daemon = auto;
            }
            if let Some(path) = own.cache_path {
                self.cache_path = Some(if path.is_absolute() {
                    path
                } else {
                    self.root.join(path)
                });
            }
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            python_files: DEFAULT_PYTHON_FILES.iter().map(ToString::to_string).collect(),
            norecursedirs: DEFAULT_NORECURSEDIRS
                .iter()
                .map(ToString::to_string)
                .collect(),
            function_prefix: DEFAULT_FUNCTION_PREFIX.to_string(),
            class_prefix: DEFAULT_CLASS_PREFIX.to_string(),
            use_cache: true,
            use_daemon: true,
            auto_start_daemon: false,
            verbose: false,
            cache_path: None,
        }
    }
}

/// Absolute, symlink-resolved form of `path`. Falls back to a lexical
/// absolute path when the path does not exist.
#[must_use]
pub fn normalize_path(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

// ─── pyproject.toml ─────────────────────────────────────────────────────────

/// pytest accepts either a whitespace-separated string or a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    String(String),
    List(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::String(s) => s.split_whitespace().map(ToString::to_string).collect(),
            Self::List(v) => v,
        }
    }
}

fn first_word(value: StringOrList) -> Option<String> {
    value.into_vec().into_iter().next()
}

#[derive(Debug, Default, Deserialize)]
struct PyProject {
    #[serde(default)]
    tool: Tool,
}

#[derive(Debug, Default, Deserialize)]
struct Tool {
    pytest: Option<PytestSection>,
    fastcollect: Option<FastcollectSection>,
}

#[derive(Debug, Deserialize)]
struct PytestSection {
    ini_options: Option<PytestOptions>,
}

#[derive(Debug, Deserialize)]
struct PytestOptions {
    python_files: Option<StringOrList>,
    norecursedirs: Option<StringOrList>,
    python_functions: Option<StringOrList>,
    python_classes: Option<StringOrList>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct FastcollectSection {
    python_files: Option<StringOrList>,
    norecursedirs: Option<StringOrList>,
    cache: Option<bool>,
    daemon: Option<bool>,
    auto_start_daemon: Option<bool>,
    cache_path: Option<PathBuf>,
}

struct ProjectSettings {
    pytest: Option<PytestOptions>,
    fastcollect: Option<FastcollectSection>,
}

fn read_project_settings(path: &Path) -> crate::Result<Option<ProjectSettings>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(eyre::eyre!("failed to read {}: {e}", path.display())),
    };

    let project: PyProject = toml::from_str(&content)
        .map_err(|e| eyre::eyre!("failed to parse {}: {e}", path.display()))?;

    let pytest = project.tool.pytest.and_then(|p| p.ini_options);
    if pytest.is_none() && project.tool.fastcollect.is_none() {
        return Ok(None);
    }
    Ok(Some(ProjectSettings {
        pytest,
        fastcollect: project.tool.fastcollect,
    }))
}
