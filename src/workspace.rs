use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::language::is_plain_file_name;

// Only the engine may list the workspace root
const ROOT_DIR_PERMISSIONS: u32 = 0o700;
// Sandboxed processes run under the engine's uid
const WORKSPACE_DIR_PERMISSIONS: u32 = 0o700;
const SOURCE_FILE_PERMISSIONS: u32 = 0o644;

const WORKSPACE_PREFIX: &str = "ws-";

/// Hands out exclusively-owned workspace directories under one root, at most
/// `capacity` at a time
pub struct WorkspaceManager {
    root: PathBuf,
    capacity: usize,
    max_source_bytes: usize,
    slots: Arc<Semaphore>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, capacity: usize, max_source_bytes: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create workspace root {}", root.display()))?;
        fs::set_permissions(&root, fs::Permissions::from_mode(ROOT_DIR_PERMISSIONS))?;
        // Bind mounts need an absolute path
        let root = root
            .canonicalize()
            .with_context(|| format!("failed to resolve workspace root {}", root.display()))?;

        Ok(Self {
            root,
            capacity,
            max_source_bytes,
            slots: Arc::new(Semaphore::new(capacity)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_source_bytes(&self) -> usize {
        self.max_source_bytes
    }

    /// Number of workspaces that could be created right now
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Allocates a fresh, empty workspace.
    ///
    /// Never waits: when every slot is taken the call fails immediately with
    /// `ResourceExhausted`.
    pub fn create(&self) -> EngineResult<Workspace> {
        let permit = Arc::clone(&self.slots).try_acquire_owned().map_err(|_| {
            EngineError::ResourceExhausted(format!(
                "all {} sandbox slots are in use",
                self.capacity
            ))
        })?;

        let name = format!("{WORKSPACE_PREFIX}{}", Uuid::new_v4().simple());
        let path = self.root.join(&name);

        fs::create_dir(&path)
            .and_then(|_| {
                fs::set_permissions(&path, fs::Permissions::from_mode(WORKSPACE_DIR_PERMISSIONS))
            })
            .map_err(|e| {
                log::error!("Failed to allocate workspace {}: {e}", path.display());
                let _ = fs::remove_dir_all(&path);
                EngineError::ResourceExhausted(format!("workspace allocation refused: {e}"))
            })?;

        log::debug!("Workspace {name} created");
        Ok(Workspace {
            name,
            path,
            source: None,
            destroyed: false,
            permit: Some(permit),
        })
    }

    /// Writes the single source artifact of `workspace`
    pub fn write_source(
        &self,
        workspace: &mut Workspace,
        filename: &str,
        content: &str,
    ) -> EngineResult<PathBuf> {
        if content.len() > self.max_source_bytes {
            return Err(EngineError::InvalidInput(format!(
                "source code is {} bytes, the limit is {}",
                content.len(),
                self.max_source_bytes
            )));
        }
        if !is_plain_file_name(filename) {
            return Err(EngineError::InvalidInput(format!(
                "invalid source filename {filename:?}"
            )));
        }
        if workspace.destroyed || workspace.source.is_some() {
            return Err(EngineError::InvalidInput(format!(
                "workspace {} cannot take another source file",
                workspace.name
            )));
        }

        let path = workspace.path.join(filename);
        fs::write(&path, content)
            .and_then(|_| fs::set_permissions(&path, fs::Permissions::from_mode(SOURCE_FILE_PERMISSIONS)))
            .map_err(|e| {
                log::error!("Failed to write source into {}: {e}", workspace.name);
                EngineError::ResourceExhausted(format!("failed to store source code: {e}"))
            })?;

        workspace.source = Some(path.clone());
        Ok(path)
    }

    /// Removes `workspace` and everything in it; see [`Workspace::destroy`]
    pub fn destroy(&self, workspace: &mut Workspace) {
        workspace.destroy();
    }

    /// Removes workspaces left behind by a previous process that died before
    /// tearing them down. Only meant to run before any request is served.
    pub fn sweep_stale(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let is_workspace = entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX);
            if !is_workspace || !entry.file_type()?.is_dir() {
                continue;
            }

            match remove_tree(&entry.path()) {
                Ok(()) => removed += 1,
                Err(e) => log::warn!(
                    "Failed to remove stale workspace {}: {e}",
                    entry.path().display()
                ),
            }
        }

        if removed > 0 {
            log::info!("Removed {removed} stale workspace(s) from {}", self.root.display());
        }
        Ok(removed)
    }
}

/// One request's filesystem scope.
///
/// Holds a concurrency slot for as long as it lives. Dropping it destroys the
/// directory, so every exit path (including a panicking runner) cleans up.
#[derive(Debug)]
pub struct Workspace {
    name: String,
    path: PathBuf,
    source: Option<PathBuf>,
    destroyed: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl Workspace {
    /// Unique name, also used to label the sandbox launched for it
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Recursively removes the directory and releases the concurrency slot.
    ///
    /// Idempotent: a second call, or a directory that is already gone, is a no-op.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        match remove_tree(&self.path) {
            Ok(()) => log::debug!("Workspace {} destroyed", self.name),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::error!("Failed to remove workspace {}: {e}", self.path.display()),
        }
        self.permit.take();
    }
}

/// Removes a directory tree. Sandboxed code may leave directories it made
/// read-only; on a permission error they are made writable again and the
/// removal is retried once.
fn remove_tree(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == ErrorKind::PermissionDenied => {
            make_writable(path);
            fs::remove_dir_all(path)
        }
        other => other,
    }
}

fn make_writable(dir: &Path) {
    if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
        log::debug!("Failed to chmod {}: {e}", dir.display());
    }
    let Ok(entries) = fs::read_dir(dir) else { return };
    for entry in entries.flatten() {
        // never follows symlinks
        if entry.file_type().is_ok_and(|t| t.is_dir()) {
            make_writable(&entry.path());
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn manager(capacity: usize) -> (tempfile::TempDir, WorkspaceManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("workspaces"), capacity, 64).unwrap();
        (dir, manager)
    }

    fn entries(manager: &WorkspaceManager) -> usize {
        fs::read_dir(manager.root()).unwrap().count()
    }

    #[test]
    fn test_create_write_destroy() {
        let (_dir, manager) = manager(2);
        let mut workspace = manager.create().unwrap();
        assert!(workspace.path().is_dir());
        assert_eq!(fs::read_dir(workspace.path()).unwrap().count(), 0);

        let source = manager.write_source(&mut workspace, "code.py", "print(1)").unwrap();
        assert_eq!(fs::read_to_string(&source).unwrap(), "print(1)");
        assert_eq!(workspace.source(), Some(source.as_path()));

        manager.destroy(&mut workspace);
        assert!(workspace.is_destroyed());
        assert!(!workspace.path().exists());
        assert_eq!(entries(&manager), 0);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (_dir, manager) = manager(1);
        let mut workspace = manager.create().unwrap();
        workspace.destroy();
        workspace.destroy();
        manager.destroy(&mut workspace);
        assert!(!workspace.path().exists());
    }

    #[test]
    fn test_destroy_tolerates_vanished_directory() {
        let (_dir, manager) = manager(1);
        let mut workspace = manager.create().unwrap();
        fs::remove_dir_all(workspace.path()).unwrap();
        workspace.destroy();
        assert_eq!(manager.available(), 1);
    }

    #[test]
    fn test_drop_removes_directory_and_frees_slot() {
        let (_dir, manager) = manager(1);
        let path = {
            let workspace = manager.create().unwrap();
            assert_eq!(manager.available(), 0);
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(manager.available(), 1);
    }

    #[test]
    fn test_capacity_is_enforced_without_waiting() {
        let (_dir, manager) = manager(2);
        let first = manager.create().unwrap();
        let _second = manager.create().unwrap();

        assert!(matches!(
            manager.create(),
            Err(EngineError::ResourceExhausted(_))
        ));

        drop(first);
        assert!(manager.create().is_ok());
    }

    #[test]
    fn test_workspaces_are_unique() {
        let (_dir, manager) = manager(2);
        let a = manager.create().unwrap();
        let b = manager.create().unwrap();
        assert_ne!(a.name(), b.name());
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_oversized_source_is_rejected() {
        let (_dir, manager) = manager(1);
        let mut workspace = manager.create().unwrap();
        let big = "x".repeat(manager.max_source_bytes() + 1);
        assert!(matches!(
            manager.write_source(&mut workspace, "code.py", &big),
            Err(EngineError::InvalidInput(_))
        ));
        assert_eq!(fs::read_dir(workspace.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_only_one_plain_source_file() {
        let (_dir, manager) = manager(1);
        let mut workspace = manager.create().unwrap();
        assert!(manager.write_source(&mut workspace, "../escape.py", "").is_err());
        manager.write_source(&mut workspace, "code.py", "").unwrap();
        assert!(matches!(
            manager.write_source(&mut workspace, "other.py", ""),
            Err(EngineError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_sweep_stale_removes_only_workspaces() {
        let (_dir, manager) = manager(1);
        let stale = manager.root().join("ws-deadbeef");
        fs::create_dir_all(stale.join("nested")).unwrap();
        fs::write(stale.join("nested/file"), "left over").unwrap();
        fs::write(manager.root().join("keep.txt"), "").unwrap();

        assert_eq!(manager.sweep_stale().unwrap(), 1);
        assert!(!stale.exists());
        assert!(manager.root().join("keep.txt").exists());
    }

    #[test]
    fn test_destroy_removes_read_only_subdirectories() {
        let (_dir, manager) = manager(1);
        let mut workspace = manager.create().unwrap();
        let locked = workspace.path().join("d");
        fs::create_dir_all(locked.join("inner")).unwrap();
        fs::write(locked.join("inner/f"), "x").unwrap();
        fs::set_permissions(locked.join("inner"), fs::Permissions::from_mode(0o500)).unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        workspace.destroy();

        assert!(!workspace.path().exists());
        assert_eq!(entries(&manager), 0);
    }
}
