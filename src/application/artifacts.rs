//! Filesystem helpers for render artifacts.
//!
//! Artifacts are always written to a sibling temporary file and renamed over
//! the canonical path once complete, so readers only ever observe a previous
//! complete version or the new complete version.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

/// `<dir>/<stem>-tmp<token>.<ext>` next to `canonical`.
pub fn temp_path_for(canonical: &Path) -> PathBuf {
    let token = Uuid::new_v4().simple().to_string();
    let stem = canonical
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match canonical.extension() {
        Some(ext) => format!("{stem}-tmp{token}.{}", ext.to_string_lossy()),
        None => format!("{stem}-tmp{token}"),
    };
    canonical.with_file_name(name)
}

/// A temporary file destined for a canonical path.
///
/// Dropping it without [`StagedArtifact::commit`] removes the temporary.
#[derive(Debug)]
pub struct StagedArtifact {
    temp: PathBuf,
    target: PathBuf,
    committed: bool,
}

impl StagedArtifact {
    pub fn new(target: &Path) -> Self {
        Self {
            temp: temp_path_for(target),
            target: target.to_path_buf(),
            committed: false,
        }
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub async fn write(&self, contents: &[u8]) -> io::Result<()> {
        let mut file = fs::File::create(&self.temp).await?;
        file.write_all(contents).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Move the temporary over the canonical path.
    pub async fn commit(mut self) -> io::Result<()> {
        fs::rename(&self.temp, &self.target).await?;
        self.committed = true;
        debug!(
            target = "application::artifacts",
            op = "artifact::commit",
            path = %self.target.display(),
            "Committed artifact"
        );
        Ok(())
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}

/// Write `contents` to `target` through a temporary file and rename.
pub async fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let staged = StagedArtifact::new(target);
    staged.write(contents).await?;
    staged.commit().await
}

/// Remove `paths`, treating already-missing files as success.
pub async fn remove_if_present<'a>(paths: impl IntoIterator<Item = &'a Path>) -> io::Result<()> {
    for path in paths {
        match fs::remove_file(path).await {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub async fn is_dir(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

pub async fn is_file(path: &Path) -> bool {
    fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

/// Check for `path`, re-checking exactly once after `retry_delay`.
///
/// Goal files are sometimes still being written by the caller when the render
/// request arrives.
pub async fn wait_for_file(path: &Path, retry_delay: Duration) -> bool {
    if is_file(path).await {
        return true;
    }
    debug!(
        target = "application::artifacts",
        op = "artifact::wait_for_file",
        path = %path.display(),
        retry_delay_ms = retry_delay.as_millis() as u64,
        "Input file missing; retrying once"
    );
    tokio::time::sleep(retry_delay).await;
    is_file(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_path_keeps_directory_and_extension() {
        let temp = temp_path_for(Path::new("/out/alice+loseit-thumb.png"));
        assert_eq!(temp.parent(), Some(Path::new("/out")));
        let name = temp.file_name().and_then(|n| n.to_str()).expect("utf-8 name");
        assert!(name.starts_with("alice+loseit-thumb-tmp"));
        assert!(name.ends_with(".png"));
        assert_ne!(temp, temp_path_for(Path::new("/out/alice+loseit-thumb.png")));
    }

    #[tokio::test]
    async fn write_atomic_replaces_existing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("goal.json");
        std::fs::write(&target, b"old").expect("seed");

        write_atomic(&target, b"new").await.expect("write");

        assert_eq!(std::fs::read(&target).expect("read"), b"new");
        let entries = std::fs::read_dir(dir.path()).expect("list").count();
        assert_eq!(entries, 1, "no temporary left behind");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_reader_sees_only_complete_versions() {
        use std::sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        };

        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("alice+loseit.png");
        let old = vec![b'o'; 4 << 20];
        let new = vec![b'n'; 4 << 20];
        std::fs::write(&target, &old).expect("seed");

        let stop = Arc::new(AtomicBool::new(false));
        let reader = {
            let stop = Arc::clone(&stop);
            let target = target.clone();
            let (old, new) = (old.clone(), new.clone());
            std::thread::spawn(move || {
                let mut reads = 0_usize;
                while !stop.load(Ordering::SeqCst) {
                    let seen = std::fs::read(&target).expect("canonical path always present");
                    assert!(
                        seen == old || seen == new,
                        "observed a partial artifact of {} bytes",
                        seen.len()
                    );
                    reads += 1;
                }
                reads
            })
        };

        for round in 0..8 {
            let contents = if round % 2 == 0 { &new } else { &old };
            write_atomic(&target, contents).await.expect("write");
        }
        stop.store(true, Ordering::SeqCst);

        let reads = reader.join().expect("reader saw only complete versions");
        assert!(reads > 0);
        assert_eq!(std::fs::read(&target).expect("read"), old);
    }

    #[tokio::test]
    async fn dropped_stage_removes_temporary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let target = dir.path().join("goal.svg");
        let staged = StagedArtifact::new(&target);
        staged.write(b"<svg/>").await.expect("write");
        let temp = staged.temp_path().to_path_buf();
        assert!(temp.exists());

        drop(staged);

        assert!(!temp.exists());
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn remove_if_present_ignores_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let present = dir.path().join("a.png");
        std::fs::write(&present, b"x").expect("seed");
        let missing = dir.path().join("b.png");

        remove_if_present([present.as_path(), missing.as_path()])
            .await
            .expect("remove");
        assert!(!present.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_file_sees_file_created_during_retry_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let goal = dir.path().join("alice+loseit.bb");
        let writer_path = goal.clone();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(&writer_path, b"{}").expect("write goal");
        });

        assert!(wait_for_file(&goal, Duration::from_millis(250)).await);
        writer.await.expect("writer task");
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_file_gives_up_after_single_retry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let goal = dir.path().join("missing.bb");
        assert!(!wait_for_file(&goal, Duration::from_millis(250)).await);
    }
}
