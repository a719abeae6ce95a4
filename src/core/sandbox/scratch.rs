use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use walkdir::WalkDir;

/// Removes whatever is at `dir` and creates it again, empty.
pub async fn recreate(dir: &Path) -> io::Result<()> {
    if tokio::fs::try_exists(dir).await? {
        clear_and_remove(dir.to_path_buf()).await?;
    }
    tokio::fs::create_dir_all(dir).await
}

/// Total size in bytes of all regular files below `dir`. Symlinks are not followed.
pub async fn dir_size(dir: PathBuf) -> io::Result<u64> {
    tokio::task::spawn_blocking(move || dir_size_blocking(&dir))
        .await
        .map_err(io::Error::other)?
}

/// Deletes every file below `dir` one by one, then the directories, then `dir`.
pub async fn clear_and_remove(dir: PathBuf) -> io::Result<()> {
    tokio::task::spawn_blocking(move || {
        match clear_blocking(&dir) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            other => other?,
        }
        fs::remove_dir(&dir)
    })
    .await
    .map_err(io::Error::other)?
}

fn dir_size_blocking(dir: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(dir).follow_links(false) {
        let meta = entry?.metadata()?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

fn clear_blocking(dir: &Path) -> io::Result<()> {
    // User code may have dropped its own write permission.
    for entry in WalkDir::new(dir).follow_links(false).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_dir() {
            let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o700));
        }
    }

    for entry in WalkDir::new(dir).follow_links(false).min_depth(1).contents_first(true) {
        let entry = entry?;
        if entry.file_type().is_dir() {
            fs::remove_dir(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
