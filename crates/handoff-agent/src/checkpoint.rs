//! The opaque dump engine and checkpoint archive packaging.
//!
//! The agent never interprets checkpoint images; it asks a [`Checkpointer`]
//! to produce one, packs the image directory into a tar+gz archive for
//! transfer, and unpacks received archives for the restore helper.

use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use thiserror::Error;

use crate::error::AgentError;

/// Dump engine failure, opaque to the orchestrator.
#[derive(Debug, Error)]
#[error("checkpoint failed: {0}")]
pub struct CheckpointError(pub String);

/// One dump invocation.
#[derive(Clone, Debug)]
pub struct DumpRequest {
    pub pid: i32,
    pub image_dir: PathBuf,
    /// Keep the process running after the dump (it keeps serving until
    /// cut-over).
    pub leave_running: bool,
    /// The process may be a shell job without its own session.
    pub shell_job: bool,
    pub orphan_pts_master: bool,
    /// External resource descriptors, e.g. the symbolic network namespace
    /// binding that lets restore happen in a different namespace.
    pub external: Vec<String>,
}

/// Opaque checkpoint engine the source orchestrator drives.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn dump(&self, request: &DumpRequest) -> Result<(), CheckpointError>;
}

/// Production engine: shells out to the `criu` binary.
pub struct CriuCheckpointer {
    binary: PathBuf,
}

impl Default for CriuCheckpointer {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("criu"),
        }
    }
}

impl CriuCheckpointer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl Checkpointer for CriuCheckpointer {
    async fn dump(&self, request: &DumpRequest) -> Result<(), CheckpointError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .arg("dump")
            .arg("--tree")
            .arg(request.pid.to_string())
            .arg("--images-dir")
            .arg(&request.image_dir);
        if request.leave_running {
            command.arg("--leave-running");
        }
        if request.shell_job {
            command.arg("--shell-job");
        }
        if request.orphan_pts_master {
            command.arg("--orphan-pts-master");
        }
        for descriptor in &request.external {
            command.arg("--external").arg(descriptor);
        }

        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| CheckpointError(format!("spawn criu: {err}")))?;
        if !output.status.success() {
            return Err(CheckpointError(format!(
                "criu dump exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Inode of a process's network namespace, used in the dump's external
/// descriptor so restore can re-bind to a different namespace.
pub fn netns_inode(pid: i32) -> Result<u64, CheckpointError> {
    std::fs::metadata(format!("/proc/{pid}/ns/net"))
        .map(|meta| meta.ino())
        .map_err(|err| CheckpointError(format!("stat /proc/{pid}/ns/net: {err}")))
}

/// The symbolic external namespace descriptor for a dump of `pid`.
pub fn external_netns_descriptor(pid: i32) -> Result<String, CheckpointError> {
    Ok(format!("net[{}]:extRootNetNS", netns_inode(pid)?))
}

/// Pack an image directory into `<dir>.tar.gz` with the directory itself as
/// the archive's single top-level entry.
pub fn pack_image_dir(image_dir: &Path) -> Result<PathBuf, AgentError> {
    let archive_path = PathBuf::from(format!("{}.tar.gz", image_dir.display()));
    let name = image_dir
        .file_name()
        .ok_or_else(|| AgentError::ArchiveFailure("image directory has no name".to_string()))?;

    let file = File::create(&archive_path).map_err(AgentError::archive)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(name, image_dir)
        .map_err(AgentError::archive)?;
    builder
        .into_inner()
        .and_then(|encoder| encoder.finish())
        .map_err(AgentError::archive)?;
    Ok(archive_path)
}

/// Unpack a received tar+gz archive under `dest`.
pub fn unpack_archive(archive_path: &Path, dest: &Path) -> Result<(), AgentError> {
    let file = File::open(archive_path).map_err(AgentError::archive)?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .map_err(AgentError::archive)
}

/// The single top-level entry of an unpacked archive; anything else is a
/// malformed checkpoint.
pub fn single_entry(dir: &Path) -> Result<PathBuf, AgentError> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(AgentError::archive)? {
        entries.push(entry.map_err(AgentError::archive)?.path());
    }
    match entries.as_slice() {
        [single] => Ok(single.clone()),
        _ => Err(AgentError::ArchiveFailure(format!(
            "expected one entry in {}, found {}",
            dir.display(),
            entries.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_round_trip_preserves_single_top_level_entry() {
        let workspace = tempfile::tempdir().expect("tempdir");
        let image_dir = workspace.path().join("171234-99");
        std::fs::create_dir(&image_dir).expect("image dir");
        std::fs::write(image_dir.join("pages-1.img"), b"fake pages").expect("image file");
        std::fs::write(image_dir.join("core-99.img"), b"fake core").expect("image file");

        let archive = pack_image_dir(&image_dir).expect("pack");
        assert!(archive.to_string_lossy().ends_with("171234-99.tar.gz"));

        let restore_dir = workspace.path().join("99-restore");
        unpack_archive(&archive, &restore_dir).expect("unpack");

        let entry = single_entry(&restore_dir).expect("single entry");
        assert_eq!(entry.file_name().expect("name"), "171234-99");
        assert_eq!(
            std::fs::read(entry.join("pages-1.img")).expect("content"),
            b"fake pages"
        );
    }

    #[test]
    fn single_entry_rejects_unexpected_layouts() {
        let workspace = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            single_entry(workspace.path()),
            Err(AgentError::ArchiveFailure(_))
        ));

        std::fs::create_dir(workspace.path().join("a")).expect("dir");
        std::fs::create_dir(workspace.path().join("b")).expect("dir");
        assert!(matches!(
            single_entry(workspace.path()),
            Err(AgentError::ArchiveFailure(_))
        ));
    }

    #[test]
    fn external_descriptor_names_own_namespace_inode() {
        let pid = std::process::id() as i32;
        let descriptor = external_netns_descriptor(pid).expect("descriptor");
        assert!(descriptor.starts_with("net["));
        assert!(descriptor.ends_with("]:extRootNetNS"));
        assert_eq!(
            descriptor,
            format!("net[{}]:extRootNetNS", netns_inode(pid).expect("inode"))
        );
    }
}
