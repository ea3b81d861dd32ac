//! Exclude rules for watch targets
//!
//! A target's rules combine:
//! 1. Configured exclude globs (gitignore syntax, relative to the root)
//! 2. The root's `.gitignore` (optional, off by default)
//! 3. Editor temp and OS litter files (optional, off by default)
//!
//! Exclusion only applies below the root; the root itself is never excluded.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vigil_core::{Result, WatchError};

/// Exclude configuration for one target
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludeConfig {
    /// Gitignore-syntax globs; `!pattern` re-includes
    pub patterns: Vec<String>,

    /// Also honor `<root>/.gitignore`
    pub use_gitignore: bool,

    /// Skip swap files, backups and OS metadata files
    pub skip_editor_temp: bool,
}

/// Compiled exclude rules, one per target
#[derive(Debug)]
pub struct ExcludeRules {
    root: PathBuf,
    patterns: Option<Gitignore>,
    gitignore: Option<Gitignore>,
    config: ExcludeConfig,
}

impl ExcludeRules {
    /// Compile rules for `root`; any bad glob fails the whole set
    pub fn build(root: &Path, config: ExcludeConfig) -> Result<Self> {
        let patterns = if config.patterns.is_empty() {
            None
        } else {
            let mut builder = GitignoreBuilder::new(root);
            for pattern in &config.patterns {
                builder
                    .add_line(None, pattern)
                    .map_err(|err| invalid(pattern, &err))?;
            }
            Some(
                builder
                    .build()
                    .map_err(|err| invalid(&config.patterns.join(", "), &err))?,
            )
        };

        let gitignore = if config.use_gitignore {
            load_gitignore(root)
        } else {
            None
        };

        Ok(Self {
            root: root.to_path_buf(),
            patterns,
            gitignore,
            config,
        })
    }

    /// Rules that exclude nothing
    pub fn empty(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            patterns: None,
            gitignore: None,
            config: ExcludeConfig::default(),
        }
    }

    /// Whether `path` is excluded
    ///
    /// `is_dir` matters for directory-only globs such as `build/`. A match on
    /// any ancestor excludes the whole subtree below it.
    pub fn is_excluded(&self, path: &Path, is_dir: bool) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        if rel.as_os_str().is_empty() {
            return false;
        }

        if self.config.skip_editor_temp && matches_editor_temp(rel) {
            return true;
        }
        if let Some(ref patterns) = self.patterns {
            if patterns.matched_path_or_any_parents(path, is_dir).is_ignore() {
                return true;
            }
        }
        if let Some(ref gitignore) = self.gitignore {
            if gitignore.matched_path_or_any_parents(path, is_dir).is_ignore() {
                return true;
            }
        }
        false
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ExcludeConfig {
        &self.config
    }

    /// Number of active rule sources
    pub fn active_sources(&self) -> usize {
        usize::from(self.patterns.is_some())
            + usize::from(self.gitignore.is_some())
            + usize::from(self.config.skip_editor_temp)
    }
}

fn invalid(pattern: &str, err: &ignore::Error) -> WatchError {
    WatchError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: err.to_string(),
    }
}

fn load_gitignore(root: &Path) -> Option<Gitignore> {
    let path = root.join(".gitignore");
    if !path.is_file() {
        debug!("no .gitignore under {}", root.display());
        return None;
    }
    let mut builder = GitignoreBuilder::new(root);
    if let Some(err) = builder.add(&path) {
        warn!("partially invalid {}: {}", path.display(), err);
    }
    match builder.build() {
        Ok(gitignore) => Some(gitignore),
        Err(err) => {
            warn!("ignoring unreadable {}: {}", path.display(), err);
            None
        }
    }
}

/// Editor swap/backup files and OS metadata litter
fn matches_editor_temp(rel: &Path) -> bool {
    let Some(name) = rel.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    // Vim swap files
    if [".swp", ".swo", ".swn", ".swx"].iter().any(|ext| name.ends_with(ext)) {
        return true;
    }
    // Backups, Emacs auto-save and lock files
    if name.ends_with('~') || (name.starts_with('#') && name.ends_with('#')) || name.starts_with(".#") {
        return true;
    }
    // MacOS / Windows metadata
    matches!(name, ".DS_Store" | "Thumbs.db" | "desktop.ini") || name.starts_with("._")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn rules(root: &Path, patterns: &[&str]) -> Result<ExcludeRules> {
        ExcludeRules::build(
            root,
            ExcludeConfig {
                patterns: patterns.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_globs_match_below_root() -> Result<()> {
        let root = Path::new("/data");
        let rules = rules(root, &["*.log", "build/"])?;

        assert!(rules.is_excluded(Path::new("/data/app.log"), false));
        assert!(rules.is_excluded(Path::new("/data/deep/nested/app.log"), false));
        assert!(rules.is_excluded(Path::new("/data/build"), true));
        assert!(rules.is_excluded(Path::new("/data/build/out.bin"), false));
        assert!(!rules.is_excluded(Path::new("/data/build"), false));
        assert!(!rules.is_excluded(Path::new("/data/src/main.rs"), false));
        Ok(())
    }

    #[test]
    fn test_root_and_outside_paths_are_never_excluded() -> Result<()> {
        let rules = rules(Path::new("/data"), &["*"])?;
        assert!(!rules.is_excluded(Path::new("/data"), true));
        assert!(!rules.is_excluded(Path::new("/elsewhere/file"), false));
        assert!(rules.is_excluded(Path::new("/data/file"), false));
        Ok(())
    }

    #[test]
    fn test_negation_reincludes() -> Result<()> {
        let rules = rules(Path::new("/data"), &["*.log", "!keep.log"])?;
        assert!(rules.is_excluded(Path::new("/data/debug.log"), false));
        assert!(!rules.is_excluded(Path::new("/data/keep.log"), false));
        Ok(())
    }

    #[test]
    fn test_invalid_glob_is_rejected() {
        let err = rules(Path::new("/data"), &["ok.txt", "broken["]).unwrap_err();
        match err {
            WatchError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "broken["),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_gitignore_is_opt_in() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join(".gitignore"), "*.tmp\n")?;
        let tmp = temp_dir.path().join("scratch.tmp");

        let off = ExcludeRules::build(temp_dir.path(), ExcludeConfig::default())?;
        assert!(!off.is_excluded(&tmp, false));
        assert_eq!(off.active_sources(), 0);

        let on = ExcludeRules::build(
            temp_dir.path(),
            ExcludeConfig {
                use_gitignore: true,
                ..Default::default()
            },
        )?;
        assert!(on.is_excluded(&tmp, false));
        assert_eq!(on.active_sources(), 1);
        Ok(())
    }

    #[test]
    fn test_editor_temp_files() -> Result<()> {
        let rules = ExcludeRules::build(
            Path::new("/data"),
            ExcludeConfig {
                skip_editor_temp: true,
                ..Default::default()
            },
        )?;
        assert!(rules.is_excluded(Path::new("/data/.main.rs.swp"), false));
        assert!(rules.is_excluded(Path::new("/data/notes.txt~"), false));
        assert!(rules.is_excluded(Path::new("/data/#draft#"), false));
        assert!(rules.is_excluded(Path::new("/data/sub/.DS_Store"), false));
        assert!(!rules.is_excluded(Path::new("/data/main.rs"), false));
        Ok(())
    }
}
