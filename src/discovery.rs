use ignore::WalkBuilder;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ModelFile {
    pub path: PathBuf,
    /// Directory this file was found under.
    pub root: PathBuf,
    pub size_bytes: u64,
}

impl ModelFile {
    pub fn name(&self) -> String {
        self.path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
    }
}

/// Places LM Studio and common manual setups keep GGUF files. Home-relative
/// roots are left out when there is no home directory.
pub fn default_search_paths(home: Option<&Path>) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Some(home) = home {
        roots.extend([
            home.join(".cache").join("lm-studio").join("models"),
            home.join(".lmstudio").join("models"),
            home.join("LM Studio").join("models"),
            home.join("models"),
            home.join("Downloads"),
        ]);
    }
    roots.push(PathBuf::from("/opt/models"));
    roots.push(PathBuf::from("/usr/local/models"));
    roots
}

/// Default roots for the current user.
pub fn search_paths_for_user() -> Vec<PathBuf> {
    let home = dirs::home_dir();
    if home.is_none() {
        tracing::warn!("no home directory; searching system model folders only");
    }
    default_search_paths(home.as_deref())
}

/// Walks every existing root and collects `.gguf` files whose path matches
/// `filter` (case-insensitive) when one is given. Missing roots are skipped.
pub fn find_gguf_models(roots: &[PathBuf], filter: Option<&str>) -> anyhow::Result<Vec<ModelFile>> {
    let re = filter.map(|f| Regex::new(&format!("(?i){f}"))).transpose()?;
    let mut out = Vec::new();
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        // model folders are rarely git checkouts; do not let ignore files hide weights
        let walker = WalkBuilder::new(root).hidden(false).git_ignore(false).ignore(false).build();
        for res in walker {
            let dirent = match res {
                Ok(d) => d,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let path = dirent.path();
            let is_gguf = path.extension().is_some_and(|e| e.eq_ignore_ascii_case("gguf"));
            if !is_gguf || !path.is_file() {
                continue;
            }
            if let Some(re) = &re {
                if !re.is_match(&path.to_string_lossy()) {
                    continue;
                }
            }
            let size_bytes = dirent.metadata().map(|m| m.len()).unwrap_or(0);
            out.push(ModelFile { path: path.to_path_buf(), root: root.clone(), size_bytes });
        }
    }
    out.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(out)
}

/// Picks the model at 1-based `index`, falling back to the first model when
/// the index is absent or out of range.
pub fn select_model(found: &[ModelFile], index: Option<usize>) -> Option<&ModelFile> {
    index
        .and_then(|i| i.checked_sub(1))
        .and_then(|i| found.get(i))
        .or_else(|| found.first())
}
