use crate::error::InstallError;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

const SHARED_LIBRARY_EXTENSIONS: [&str; 3] = ["dll", "so", "dylib"];

pub async fn extract_archive(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    tokio::fs::create_dir_all(dest).await?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if name.ends_with(".zip") {
        extract_zip(archive, dest).await
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        extract_tar_gz(archive, dest).await
    } else {
        Err(InstallError::Extract(format!("unknown archive type: {name}")))
    }
}

async fn extract_zip(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let archive = archive.to_path_buf();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&archive)?;
        let mut zip =
            zip::ZipArchive::new(file).map_err(|e| InstallError::Extract(e.to_string()))?;
        zip.extract(&dest)
            .map_err(|e| InstallError::Extract(e.to_string()))
    })
    .await
    .map_err(|e| InstallError::Extract(e.to_string()))?
}

async fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<(), InstallError> {
    let output = Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(InstallError::Extract(format!(
            "tar exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Recursive search for a file with exactly `name` under `root`
pub fn find_file(root: &Path, name: &str) -> Vec<PathBuf> {
    let pattern = format!(
        "{}/**/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        glob::Pattern::escape(name)
    );
    match glob::glob(&pattern) {
        Ok(paths) => paths
            .filter_map(Result::ok)
            .filter(|path| path.is_file())
            .collect(),
        Err(e) => {
            debug!(pattern = %pattern, error = %e, "Invalid search pattern");
            Vec::new()
        }
    }
}

pub fn is_shared_library(path: &Path) -> bool {
    let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_lowercase()) else {
        return false;
    };
    SHARED_LIBRARY_EXTENSIONS
        .iter()
        .any(|ext| name.ends_with(&format!(".{ext}")))
        || name.contains(".so.")
}

/// Copy `source` to `dest_dir/binary_name`, optionally with the shared
/// libraries next to it, and mark it executable
pub async fn install_executable(
    source: &Path,
    dest_dir: &Path,
    binary_name: &str,
    with_libraries: bool,
) -> Result<PathBuf, InstallError> {
    tokio::fs::create_dir_all(dest_dir).await?;
    let target = dest_dir.join(binary_name);
    tokio::fs::copy(source, &target).await?;

    if with_libraries {
        if let Some(source_dir) = source.parent() {
            copy_libraries(source_dir, dest_dir).await?;
        }
    }

    set_executable(&target).await?;
    info!(path = %target.display(), "Installed core executable");
    Ok(target)
}

async fn copy_libraries(source_dir: &Path, dest_dir: &Path) -> Result<(), InstallError> {
    if source_dir == dest_dir {
        return Ok(());
    }
    let mut entries = tokio::fs::read_dir(source_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !is_shared_library(&path) || !entry.file_type().await?.is_file() {
            continue;
        }
        let target = dest_dir.join(entry.file_name());
        tokio::fs::copy(&path, &target).await?;
        debug!(library = %target.display(), "Copied shared library");
    }
    Ok(())
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<(), InstallError> {
    use std::os::unix::fs::PermissionsExt;

    let mut permissions = tokio::fs::metadata(path).await?.permissions();
    permissions.set_mode(permissions.mode() | 0o755);
    tokio::fs::set_permissions(path, permissions).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<(), InstallError> {
    Ok(())
}
