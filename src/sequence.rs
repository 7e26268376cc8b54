use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::error::{KaravaError, KaravaResult};

/// A directory of sequential frames in strict `frame-%05d.<ext>` form,
/// ready to be read as an ffmpeg image2 input.
#[derive(Clone, Debug)]
pub struct FrameSequence {
    pub dir: PathBuf,
    /// image2 pattern, e.g. `frame-%05d.png`.
    pub pattern: String,
    pub frame_count: u64,
}

impl FrameSequence {
    pub fn pattern_path(&self) -> PathBuf {
        self.dir.join(&self.pattern)
    }
}

/// Rewrite a renderer's frame output into a strict zero-based, zero-padded
/// sequence. The renderer only guarantees an embedded numeric index per
/// file, not contiguity or padding, and ffmpeg's image2 demuxer needs both.
///
/// Renames run in two phases through temporary names so a target name that
/// collides with a not-yet-renamed source cannot clobber it.
pub fn normalize_frame_sequence(dir: &Path) -> KaravaResult<FrameSequence> {
    let index_re = regex::Regex::new(r"(\d+)").expect("static regex");

    let mut frames: Vec<(u64, String, PathBuf)> = Vec::new();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("read frame directory '{}'", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| "read frame directory entry")?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(".norm-") {
            // Staging leftover from an interrupted earlier pass; treating
            // it as a frame would let a phase-1 rename clobber real input.
            tracing::debug!(file = name, "skipping stale staging file");
            continue;
        }
        let stem = name.rsplit_once('.').map_or(name, |(stem, _)| stem);
        // The frame index is the last digit run in the stem; earlier runs
        // can belong to the composition name.
        match index_re.find_iter(stem).last() {
            Some(m) => {
                let index: u64 = m.as_str().parse().map_err(|_| {
                    KaravaError::validation(format!("frame index overflows in '{name}'"))
                })?;
                frames.push((index, name.to_string(), path));
            }
            None => {
                tracing::debug!(file = name, "skipping frame file without numeric index");
            }
        }
    }

    if frames.is_empty() {
        return Err(KaravaError::validation(format!(
            "no indexed frame files in '{}'",
            dir.display()
        )));
    }

    let mut ext: Option<String> = None;
    for (_, name, _) in &frames {
        let this = name.rsplit_once('.').map(|(_, e)| e.to_ascii_lowercase());
        let Some(this) = this else {
            return Err(KaravaError::validation(format!(
                "frame file '{name}' has no extension"
            )));
        };
        match &ext {
            None => ext = Some(this),
            Some(prev) if *prev != this => {
                return Err(KaravaError::validation(format!(
                    "mixed frame extensions in '{}' ({prev} vs {this})",
                    dir.display()
                )));
            }
            Some(_) => {}
        }
    }
    let ext = ext.expect("non-empty frame list");

    frames.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    // Phase 1: move everything aside.
    let mut staged = Vec::with_capacity(frames.len());
    for (i, (_, _, path)) in frames.iter().enumerate() {
        let tmp = dir.join(format!(".norm-{i}.{ext}"));
        std::fs::rename(path, &tmp)
            .with_context(|| format!("stage frame '{}'", path.display()))?;
        staged.push(tmp);
    }

    // Phase 2: final zero-based names.
    for (i, tmp) in staged.iter().enumerate() {
        let target = dir.join(format!("frame-{i:05}.{ext}"));
        std::fs::rename(tmp, &target)
            .with_context(|| format!("rename frame to '{}'", target.display()))?;
    }

    Ok(FrameSequence {
        dir: dir.to_path_buf(),
        pattern: format!("frame-%05d.{ext}"),
        frame_count: staged.len() as u64,
    })
}
