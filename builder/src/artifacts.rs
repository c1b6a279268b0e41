//! Artifact upload (spec.md §4.E): on success of the task's final step,
//! glob the configured patterns relative to the build output, stage each
//! match under a timestamp-prefixed name so concurrent tasks can never
//! clobber one another, then hand each staged file to the link for
//! upload as a `com-warmcat-sai-artifact` header followed by the raw
//! blob. Grounded in the original builder's `b-artifacts.c` staging
//! step, translated from its lws secondary-stream transport to a framer
//! buflist drained over the same websocket as everything else.
//!
//! Patterns travel as an ordinary build-script line prefixed with
//! `@sai-artifacts `, recognized by [`crate::executor`] as a pseudo-step
//! rather than a shell invocation (same sentinel convention as the
//! mirror/checkout steps) — no task-store schema change needed to carry
//! a dedicated artifacts field.

use crate::error::BuilderResult;
use glob::glob;
use sai_framer::buflist::OutboundBuflist;
use sai_framer::schema::ArtifactHeader;
use std::path::{Path, PathBuf};

pub const ARTIFACTS_SENTINEL: &str = "@sai-artifacts";

pub struct StagedArtifact {
    pub header: ArtifactHeader,
    pub path: PathBuf,
}

/// Globs `patterns` (one per line, as configured on the task) relative to
/// `build_dir`, renaming each match into `<home>/.sai-uploads/` with a
/// timestamp prefix.
pub fn stage_artifacts(
    task_uuid: &str,
    art_up_nonce: &str,
    build_dir: &Path,
    home: &Path,
    patterns: &str,
    now: i64,
) -> BuilderResult<Vec<StagedArtifact>> {
    let staging_dir = home.join(".sai-uploads");
    std::fs::create_dir_all(&staging_dir)?;

    let mut staged = Vec::new();
    for pattern in patterns.split_whitespace() {
        let full_pattern = build_dir.join(pattern);
        let full_pattern = full_pattern.to_string_lossy().into_owned();
        let matches = glob(&full_pattern)
            .map_err(|e| crate::error::BuilderError::BadGlob(full_pattern.clone(), e))?;
        for entry in matches.flatten() {
            let Some(basename) = entry.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let staged_name = format!("{now}-{basename}");
            let dest = staging_dir.join(&staged_name);
            std::fs::rename(&entry, &dest)?;
            let len = std::fs::metadata(&dest)?.len() as i64;
            staged.push(StagedArtifact {
                header: ArtifactHeader {
                    task_uuid: task_uuid.to_string(),
                    blob_filename: basename.to_string(),
                    artifact_up_nonce: art_up_nonce.to_string(),
                    len,
                },
                path: dest,
            });
        }
    }
    Ok(staged)
}

/// Builds the outbound buflist carrying one staged artifact's blob
/// bytes, chunked to `chunk_size` (spec.md §4.F transport draining). The
/// header itself travels separately as a `BuilderFrame::Artifact` so it
/// goes through the same JSON-frame path as every other control
/// message; this buflist supplies only the binary body that follows it,
/// matching spec.md §4.E's "header... immediately followed by the
/// binary blob bytes."
pub fn queue_upload(staged: &StagedArtifact, chunk_size: usize) -> BuilderResult<OutboundBuflist> {
    let mut buf = OutboundBuflist::new();
    let bytes = std::fs::read(&staged.path)?;
    if bytes.is_empty() {
        buf.queue_tx(bytes::Bytes::new(), true, true);
        return Ok(buf);
    }
    let mut chunks = bytes.chunks(chunk_size.max(1)).peekable();
    let mut first = true;
    while let Some(chunk) = chunks.next() {
        let last = chunks.peek().is_none();
        buf.queue_tx(bytes::Bytes::copy_from_slice(chunk), first, last);
        first = false;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn stages_matching_files_with_timestamp_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("build");
        std::fs::create_dir_all(&build_dir).unwrap();
        let mut f = std::fs::File::create(build_dir.join("out.bin")).unwrap();
        f.write_all(b"hello").unwrap();

        let staged = stage_artifacts("t", "nonce", &build_dir, dir.path(), "out.bin", 12345).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].header.blob_filename, "out.bin");
        assert!(staged[0].path.file_name().unwrap().to_str().unwrap().starts_with("12345-"));
        assert!(!build_dir.join("out.bin").exists());
    }

    #[test]
    fn no_matches_yields_empty_vec() {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("build");
        std::fs::create_dir_all(&build_dir).unwrap();
        let staged = stage_artifacts("t", "nonce", &build_dir, dir.path(), "*.nope", 1).unwrap();
        assert!(staged.is_empty());
    }
}
