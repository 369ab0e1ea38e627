#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && (m.permissions().mode() & 0o111 != 0))
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}

fn path_contains_separator(cmd: &str) -> bool {
    cmd.contains(std::path::MAIN_SEPARATOR) || cmd.contains('/')
}

fn find_executable_in_dirs(name: &str, dirs: &[PathBuf]) -> Option<PathBuf> {
    if name.trim().is_empty() {
        return None;
    }
    dirs.iter()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Resolves an interpreter given either as a path or as a name on `PATH`.
pub(crate) fn resolve_command(cmd: &str) -> Option<PathBuf> {
    let trimmed = cmd.trim();
    if trimmed.is_empty() {
        return None;
    }
    if path_contains_separator(trimmed) {
        let path = PathBuf::from(trimmed);
        return is_executable(&path).then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    let dirs = std::env::split_paths(&path_var).collect::<Vec<_>>();
    find_executable_in_dirs(trimmed, &dirs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_stub(dir: &Path, name: &str) -> PathBuf {
        let stub = dir.join(name);
        fs::write(&stub, "#!/bin/sh\necho ok\n").expect("write stub");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(&stub).expect("meta").permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&stub, perms).expect("chmod");
        }
        stub
    }

    #[test]
    fn finds_stub_interpreter_in_dirs() {
        let dir = tempfile::tempdir().expect("temp dir");
        write_stub(dir.path(), "python3");
        let found = find_executable_in_dirs("python3", &[dir.path().to_path_buf()]);
        assert_eq!(found, Some(dir.path().join("python3")));
        assert_eq!(find_executable_in_dirs("python9", &[dir.path().to_path_buf()]), None);
    }

    #[test]
    fn resolves_explicit_paths() {
        let dir = tempfile::tempdir().expect("temp dir");
        let stub = write_stub(dir.path(), "py");
        assert_eq!(resolve_command(stub.to_string_lossy().as_ref()), Some(stub));
        assert_eq!(resolve_command("  "), None);
        assert_eq!(
            resolve_command(dir.path().join("missing").to_string_lossy().as_ref()),
            None
        );
    }
}
