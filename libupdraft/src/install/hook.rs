// Copyright © 2022 The Updraft Contributors
//
// This file is part of updraft, distributed under the GPLv3 or later.
// For full terms see the included LICENSE file.

//! The bundled migration hook.
//!
//! A package may ship a `migrate.json` next to its content: a declarative
//! list of steps executed against the staged tree before anything goes
//! live. Steps are confined to the staging directory by construction —
//! there is no way to express a path outside it, and no code from the
//! artifact ever runs.

use std::{
    fs,
    io,
    path::{Component, Path, PathBuf},
};

use serde::Deserialize;
use thiserror::Error;

pub const HOOK_FILE: &str = "migrate.json";

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("malformed migration hook")]
    Malformed(#[source] serde_json::Error),

    #[error("hook path `{0}` leaves the staged tree")]
    Escape(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Mkdir { path: String },
    Rename { from: String, to: String },
    Remove { path: String },
}

/// Run the staged tree's migration hook, if it ships one.
///
/// Returns the number of steps executed. The hook file itself is consumed:
/// it is install metadata, not package content.
pub fn run(staged: &Path) -> Result<usize, Error> {
    let hook_path = staged.join(HOOK_FILE);
    let raw = match fs::read(&hook_path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let steps: Vec<Step> = serde_json::from_slice(&raw).map_err(Error::Malformed)?;

    for step in &steps {
        match step {
            Step::Mkdir { path } => {
                fs::create_dir_all(resolve(staged, path)?)?;
            },
            Step::Rename { from, to } => {
                let to = resolve(staged, to)?;
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(resolve(staged, from)?, to)?;
            },
            Step::Remove { path } => {
                let path = resolve(staged, path)?;
                if path.is_dir() {
                    fs::remove_dir_all(path)?;
                } else {
                    fs::remove_file(path)?;
                }
            },
        }
    }

    fs::remove_file(hook_path)?;
    Ok(steps.len())
}

/// Join `raw` under `root`, admitting only plain relative components.
fn resolve(root: &Path, raw: &str) -> Result<PathBuf, Error> {
    let path = Path::new(raw);
    let plain = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if !plain {
        return Err(Error::Escape(raw.to_string()));
    }
    Ok(root.join(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn staged(hook: Option<&serde_json::Value>) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present.txt"), b"here").unwrap();
        if let Some(hook) = hook {
            fs::write(dir.path().join(HOOK_FILE), hook.to_string()).unwrap();
        }
        dir
    }

    #[test]
    fn test_no_hook_is_a_noop() {
        let dir = staged(None);
        assert_eq!(run(dir.path()).unwrap(), 0);
        assert!(dir.path().join("present.txt").exists());
    }

    #[test]
    fn test_steps_execute_in_order() {
        let hook = json!([
            { "op": "mkdir", "path": "nested/deep" },
            { "op": "rename", "from": "present.txt", "to": "nested/deep/moved.txt" },
        ]);
        let dir = staged(Some(&hook));
        assert_eq!(run(dir.path()).unwrap(), 2);
        assert!(dir.path().join("nested/deep/moved.txt").exists());
        assert!(!dir.path().join("present.txt").exists());
        assert!(!dir.path().join(HOOK_FILE).exists());
    }

    #[test]
    fn test_absolute_path_is_rejected() {
        let hook = json!([{ "op": "remove", "path": "/etc/passwd" }]);
        let dir = staged(Some(&hook));
        assert!(matches!(run(dir.path()), Err(Error::Escape(_))));
    }

    #[test]
    fn test_parent_traversal_is_rejected() {
        let hook = json!([{ "op": "rename", "from": "present.txt", "to": "../outside.txt" }]);
        let dir = staged(Some(&hook));
        assert!(matches!(run(dir.path()), Err(Error::Escape(_))));
        assert!(dir.path().join("present.txt").exists());
    }

    #[test]
    fn test_malformed_hook_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(HOOK_FILE), b"not json").unwrap();
        assert!(matches!(run(dir.path()), Err(Error::Malformed(_))));
    }
}
