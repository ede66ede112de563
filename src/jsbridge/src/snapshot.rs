/*!
Snapshot blobs used to pre-populate new contexts.

The engine cannot serialize a live heap, so a blob records the seed script and the globals it
defined, after checking in a throwaway engine that the seed runs cleanly. Contexts constructed
from a blob replay the seed before anything else is installed.
*/

use std::fmt;

use rquickjs::{Context, Ctx, Runtime};
use serde::{Deserialize, Serialize};
use tracing::{Level, instrument};

use crate::bridge::exception::CatchJsErrorExt;
use crate::error::{Error, Result};
use crate::script;

const SNAPSHOT_FORMAT: u32 = 1;
const SNAPSHOT_IDENTIFIER: &str = "<snapshot>";
const GLOBAL_NAMES: &str = "Object.getOwnPropertyNames(globalThis)";

/// An opaque, versioned image of a seeded engine.
#[derive(Clone, PartialEq, Eq)]
pub struct SnapshotBlob(Vec<u8>);

impl SnapshotBlob {
    /// Wrap bytes previously obtained from [`SnapshotBlob::as_bytes`]. They are checked when a
    /// context is constructed from the blob.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The encoded image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Size of the encoded image in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for an empty blob, which never decodes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The global names the seed defines.
    pub fn globals(&self) -> Result<Vec<String>> {
        Ok(decode_image(&self.0)?.globals)
    }
}

impl fmt::Debug for SnapshotBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotBlob")
            .field("len", &self.0.len())
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct SnapshotImage {
    format: u32,
    source: String,
    globals: Vec<String>,
}

fn decode_image(bytes: &[u8]) -> Result<SnapshotImage> {
    let image: SnapshotImage = serde_json::from_slice(bytes)
        .map_err(|e| Error::InvalidArgument(format!("snapshot blob does not decode: {e}")))?;
    if image.format != SNAPSHOT_FORMAT {
        return Err(Error::InvalidArgument(format!(
            "unsupported snapshot format {}, expected {SNAPSHOT_FORMAT}",
            image.format
        )));
    }
    Ok(image)
}

/// Check and decode a blob handed to a context.
pub(crate) fn decode(blob: &SnapshotBlob, max_len: usize) -> Result<SnapshotImage> {
    if blob.len() > max_len {
        return Err(Error::InvalidArgument(format!(
            "snapshot blob of {} bytes exceeds the maximum length of {max_len} bytes",
            blob.len()
        )));
    }
    decode_image(&blob.0)
}

/// Run the seed of `image` in `ctx`.
pub(crate) fn replay(ctx: &Ctx<'_>, image: &SnapshotImage) -> Result<()> {
    let compiled = script::compile(ctx, &image.source, SNAPSHOT_IDENTIFIER)
        .catch_guest(ctx, Error::Compile)?;
    script::run(ctx, &compiled).catch_guest(ctx, Error::Runtime)?;
    tracing::debug!(globals = image.globals.len(), "Replayed snapshot");
    Ok(())
}

/// Capture `source` as a snapshot, or `None` if it is empty or fails to run.
#[instrument(skip_all, level = Level::DEBUG)]
pub(crate) fn create(source: &str) -> Option<SnapshotBlob> {
    if source.is_empty() {
        tracing::warn!("Snapshot source is empty, no snapshot created");
        return None;
    }
    match capture(source) {
        Ok(blob) => Some(blob),
        Err(e) => {
            tracing::warn!("Failed to create snapshot: {e}");
            None
        }
    }
}

fn capture(source: &str) -> Result<SnapshotBlob> {
    let runtime = Runtime::new()?;
    let context = Context::full(&runtime)?;
    let globals = context.with(|ctx| -> Result<Vec<String>> {
        let before: Vec<String> = ctx.eval(GLOBAL_NAMES)?;
        let compiled = script::compile(&ctx, source, SNAPSHOT_IDENTIFIER)
            .catch_guest(&ctx, Error::Compile)?;
        script::run(&ctx, &compiled).catch_guest(&ctx, Error::Runtime)?;
        let after: Vec<String> = ctx.eval(GLOBAL_NAMES)?;
        Ok(after
            .into_iter()
            .filter(|name| !before.contains(name))
            .collect())
    })?;

    let image = SnapshotImage {
        format: SNAPSHOT_FORMAT,
        source: source.to_string(),
        globals,
    };
    let bytes = serde_json::to_vec(&image)
        .map_err(|e| Error::UnsupportedOperation(format!("snapshot encoding: {e}")))?;
    Ok(SnapshotBlob(bytes))
}
