//! # Disk Resolver
//!
//! Compiles local `.proto` files into a `FileDescriptorSet` by shelling out
//! to `protoc`, for servers that do not expose reflection.
//!
//! The compiler writes the descriptor set (with imports included) to a
//! scratch file under the system temp directory, which is read back, decoded
//! and removed. The `protoc` binary is taken from the `PROTOC` environment
//! variable when set, matching the convention of `prost-build`.
use prost::Message;
use prost_types::FileDescriptorSet;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ProtoCompileError {
    #[error("no proto files were provided")]
    NoFiles,

    #[error("failed to run protoc: '{0}'")]
    Spawn(#[source] std::io::Error),

    #[error("protoc exited with {status}: {output}")]
    Compiler { status: ExitStatus, output: String },

    #[error("failed to read the compiled descriptor set back: '{0}'")]
    ReadBack(#[source] std::io::Error),

    #[error("failed to decode the compiled descriptor set: '{0}'")]
    Decode(#[from] prost::DecodeError),
}

static SCRATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Compiles `proto_files` into a single `FileDescriptorSet`.
///
/// Each file's parent directory is added as an import root in addition to the
/// explicit `import_paths`, so sibling imports resolve without configuration.
pub async fn compile(
    proto_files: &[PathBuf],
    import_paths: &[PathBuf],
) -> Result<FileDescriptorSet, ProtoCompileError> {
    if proto_files.is_empty() {
        return Err(ProtoCompileError::NoFiles);
    }

    let scratch = scratch_path();
    let result = run_protoc(proto_files, import_paths, &scratch).await;

    if let Err(e) = tokio::fs::remove_file(&scratch).await {
        tracing::debug!(path = %scratch.display(), error = %e, "failed to remove scratch descriptor file");
    }

    result
}

async fn run_protoc(
    proto_files: &[PathBuf],
    import_paths: &[PathBuf],
    scratch: &Path,
) -> Result<FileDescriptorSet, ProtoCompileError> {
    let protoc = std::env::var_os("PROTOC").unwrap_or_else(|| "protoc".into());

    let mut roots: BTreeSet<PathBuf> = import_paths.iter().cloned().collect();
    for file in proto_files {
        if let Some(parent) = file.parent() {
            roots.insert(parent.to_path_buf());
        }
    }

    let mut command = Command::new(&protoc);
    command
        .arg(format!("--descriptor_set_out={}", scratch.display()))
        .arg("--include_imports");
    for root in &roots {
        command.arg("--proto_path").arg(root);
    }
    command.args(proto_files);

    tracing::debug!(files = proto_files.len(), "compiling proto files with protoc");

    let output = command.output().await.map_err(ProtoCompileError::Spawn)?;

    if !output.status.success() {
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(ProtoCompileError::Compiler {
            status: output.status,
            output: combined.trim().to_string(),
        });
    }

    let bytes = tokio::fs::read(scratch)
        .await
        .map_err(ProtoCompileError::ReadBack)?;

    Ok(FileDescriptorSet::decode(bytes.as_slice())?)
}

fn scratch_path() -> PathBuf {
    let unique = SCRATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
        "sonda-descriptors-{}-{unique}.pb",
        std::process::id()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_an_empty_file_list() {
        let err = compile(&[], &[]).await.unwrap_err();
        assert!(matches!(err, ProtoCompileError::NoFiles));
    }

    #[test]
    fn scratch_paths_are_unique() {
        assert_ne!(scratch_path(), scratch_path());
    }
}
