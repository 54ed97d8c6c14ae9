use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::domain::{Configuration, EngineSettings};
use crate::core::error::{RmcError, Result};
use crate::core::spatial::BoundaryConditions;
use crate::engine::constraint::AnyConstraint;
use crate::engine::group::Group;
use crate::engine::selectors::GroupSelector;

/// Bumped whenever the persisted layout changes incompatibly.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Run-level counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub step: u64,
    pub generated: u64,
    pub accepted: u64,
    pub rejected: u64,
}

/// Everything needed to resume a run bit-for-bit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineState {
    pub id: Uuid,
    pub settings: EngineSettings,
    pub configuration: Configuration,
    pub boundary: Option<BoundaryConditions>,
    pub groups: Vec<Group>,
    pub selector: GroupSelector,
    pub constraints: Vec<AnyConstraint>,
    pub counters: RunCounters,
    pub rng: ChaCha8Rng,
}

#[derive(Serialize)]
struct EnvelopeRef<'a> {
    format_version: u32,
    saved_at: String,
    state: &'a EngineState,
}

#[derive(Deserialize)]
struct Header {
    format_version: u32,
}

#[derive(Deserialize)]
struct Envelope {
    saved_at: String,
    state: EngineState,
}

/// Metadata read back with a checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointInfo {
    pub format_version: u32,
    pub saved_at: String,
}

/// Writes to a temporary file in the target directory, then renames it over
/// `path`. Readers see either the previous checkpoint or the new one.
pub fn write_checkpoint(path: &Path, state: &EngineState) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer(
            &mut writer,
            &EnvelopeRef {
                format_version: CHECKPOINT_VERSION,
                saved_at: Utc::now().to_rfc3339(),
                state,
            },
        )?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| RmcError::Io(e.error))?;
    Ok(())
}

/// Reads a checkpoint, refusing any other format version before touching
/// the payload.
pub fn read_checkpoint(path: &Path) -> Result<(EngineState, CheckpointInfo)> {
    let text = fs::read_to_string(path)?;
    let header: Header = serde_json::from_str(&text).map_err(|e| {
        RmcError::Checkpoint(format!("{}: missing or unreadable header ({})", path.display(), e))
    })?;
    if header.format_version != CHECKPOINT_VERSION {
        return Err(RmcError::Checkpoint(format!(
            "{}: format version {} is not supported (expected {})",
            path.display(),
            header.format_version,
            CHECKPOINT_VERSION
        )));
    }
    let envelope: Envelope = serde_json::from_str(&text).map_err(|e| {
        RmcError::Checkpoint(format!("{}: corrupt payload ({})", path.display(), e))
    })?;
    Ok((
        envelope.state,
        CheckpointInfo {
            format_version: header.format_version,
            saved_at: envelope.saved_at,
        },
    ))
}
