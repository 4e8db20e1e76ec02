//! XDG desktop entry lookup for identifier targets
//!
//! An identifier such as `org.example.SyncAgent` names the desktop file
//! `org.example.SyncAgent.desktop`. Its `Exec=` line tells which program the
//! running process will be.

use std::fs;
use std::path::{Path, PathBuf};

/// Directories searched for `<identifier>.desktop`, most specific first
pub fn application_dirs() -> Vec<PathBuf> {
    let mut dirs_found = Vec::new();
    if let Some(data) = dirs::data_dir() {
        dirs_found.push(data.join("applications"));
    }

    let system = std::env::var("XDG_DATA_DIRS")
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "/usr/local/share:/usr/share".to_string());
    dirs_found.extend(
        system
            .split(':')
            .filter(|s| !s.is_empty())
            .map(|s| PathBuf::from(s).join("applications")),
    );
    dirs_found.push(PathBuf::from("/var/lib/flatpak/exports/share/applications"));
    dirs_found
}

/// Find the desktop file for an identifier
pub fn find_desktop_file(identifier: &str, search: &[PathBuf]) -> Option<PathBuf> {
    let file = format!("{}.desktop", identifier);
    search.iter().map(|dir| dir.join(&file)).find(|p| p.is_file())
}

/// Program name from the `Exec=` key of the `[Desktop Entry]` group.
///
/// Field codes and arguments are dropped, `env VAR=x prog` is unwrapped, and
/// only the file name of the program is kept.
pub fn exec_program(contents: &str) -> Option<String> {
    let mut in_entry = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_entry = line == "[Desktop Entry]";
            continue;
        }
        if !in_entry {
            continue;
        }
        if let Some(exec) = line.strip_prefix("Exec=") {
            return program_from_exec(exec);
        }
    }
    None
}

fn program_from_exec(exec: &str) -> Option<String> {
    let mut words = exec.split_whitespace().map(|w| w.trim_matches('"'));
    let mut program = words.next()?;

    if program == "env" || program.ends_with("/env") {
        program = words.find(|w| !w.contains('='))?;
    }

    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
}

/// Program an identifier target runs as.
///
/// Falls back to the last dotted segment when no desktop entry resolves.
pub fn resolve_program(identifier: &str, search: &[PathBuf]) -> String {
    find_desktop_file(identifier, search)
        .and_then(|path| fs::read_to_string(path).ok())
        .and_then(|contents| exec_program(&contents))
        .unwrap_or_else(|| last_segment(identifier).to_string())
}

fn last_segment(identifier: &str) -> &str {
    identifier.rsplit('.').next().unwrap_or(identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ENTRY: &str = "\
[Desktop Entry]
Name=Sync Agent
Exec=/opt/sync/bin/sync-agent --minimized %U
Type=Application

[Desktop Action Quit]
Exec=sync-agent --quit
";

    #[test]
    fn exec_strips_path_and_arguments() {
        assert_eq!(exec_program(ENTRY), Some("sync-agent".into()));
    }

    #[test]
    fn exec_unwraps_env() {
        let entry = "[Desktop Entry]\nExec=env GDK_BACKEND=x11 \"/usr/bin/agent\" %f\n";
        assert_eq!(exec_program(entry), Some("agent".into()));
    }

    #[test]
    fn exec_outside_main_group_is_ignored() {
        let entry = "[Desktop Action New]\nExec=other\n";
        assert_eq!(exec_program(entry), None);
    }

    #[test]
    fn resolves_through_desktop_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("org.example.SyncAgent.desktop"), ENTRY).unwrap();
        let search = vec![tmp.path().to_path_buf()];

        assert_eq!(resolve_program("org.example.SyncAgent", &search), "sync-agent");
        assert_eq!(resolve_program("org.example.Other", &search), "Other");
    }
}
