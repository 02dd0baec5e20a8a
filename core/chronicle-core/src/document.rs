//! Document path helpers: titles and the sidecar files that travel with a note.
//!
//! For a note at `<dir>/<stem>.md`:
//! - session metadata lives at `<dir>/.meta/<stem>.json`
//! - the raw capture copy defaults to `<dir>/.raw/<stem>.md`

use std::path::{Path, PathBuf};

pub const META_DIR: &str = ".meta";
pub const RAW_DIR: &str = ".raw";

/// Extracts the first H1 (`# Title`) heading from markdown content.
pub fn extract_title(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

/// Title used in commit messages: the H1 heading, else the file stem.
pub fn document_title(document: &Path) -> String {
    fs_err::read_to_string(document)
        .ok()
        .and_then(|content| extract_title(&content))
        .unwrap_or_else(|| file_stem(document))
}

pub fn file_stem(document: &Path) -> String {
    document
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "untitled".to_string())
}

pub fn meta_path(document: &Path) -> PathBuf {
    let dir = document.parent().unwrap_or(Path::new("."));
    dir.join(META_DIR).join(format!("{}.json", file_stem(document)))
}

pub fn default_raw_capture_path(document: &Path) -> PathBuf {
    let dir = document.parent().unwrap_or(Path::new("."));
    let name = document
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "untitled.md".to_string());
    dir.join(RAW_DIR).join(name)
}

/// Path relative to `workspace`, or the file name when outside it.
pub fn relative_to(workspace: &Path, document: &Path) -> String {
    document
        .strip_prefix(workspace)
        .map(|relative| relative.to_string_lossy().to_string())
        .unwrap_or_else(|_| {
            document
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_first_h1() {
        assert_eq!(
            extract_title("# Hello World\n\nContent"),
            Some("Hello World".to_string())
        );
        assert_eq!(
            extract_title("## Not H1\n# This is H1"),
            Some("This is H1".to_string())
        );
        assert_eq!(extract_title("No heading here"), None);
        assert_eq!(extract_title("#NoSpace"), None);
        assert_eq!(extract_title("#   \n# Real"), Some("Real".to_string()));
    }

    #[test]
    fn sidecar_paths_follow_document() {
        let document = Path::new("/workspace/notes/2026-01-31-standup.md");
        assert_eq!(
            meta_path(document),
            Path::new("/workspace/notes/.meta/2026-01-31-standup.json")
        );
        assert_eq!(
            default_raw_capture_path(document),
            Path::new("/workspace/notes/.raw/2026-01-31-standup.md")
        );
    }

    #[test]
    fn title_falls_back_to_stem() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let with_heading = temp_dir.path().join("a.md");
        fs_err::write(&with_heading, "# Weekly Sync\nbody").expect("write");
        assert_eq!(document_title(&with_heading), "Weekly Sync");

        let plain = temp_dir.path().join("scratch.md");
        fs_err::write(&plain, "just text").expect("write");
        assert_eq!(document_title(&plain), "scratch");
        assert_eq!(document_title(&temp_dir.path().join("missing.md")), "missing");
    }

    #[test]
    fn relative_path_inside_and_outside_workspace() {
        let workspace = Path::new("/workspace");
        assert_eq!(relative_to(workspace, Path::new("/workspace/notes/a.md")), "notes/a.md");
        assert_eq!(relative_to(workspace, Path::new("/elsewhere/b.md")), "b.md");
    }
}
