//! Per-device pipeline wiring: spawns the background stages and runs
//! ingest in the calling thread.

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use camgate_store::Store;
use tracing::info;

use crate::{
    archive::Archiver,
    history,
    ingest::{IngestConfig, Ingestor},
    live, retention,
    ring::MemoryRing,
};

pub struct PipelineConfig {
    pub device_id: String,
    pub rtsp_url: String,
    pub rtmp_url: Option<String>,
    /// Compressed ring length in frames; 0 disables historical queries.
    pub memory_buffer: usize,
    /// Scale expression for historical output, e.g. `-1:-1` or `640:-1`.
    pub memory_scale: String,
    /// Segment root; archiving is disabled when absent.
    pub disk_path: Option<PathBuf>,
    /// Age beyond which segments are deleted.
    pub retention: Duration,
}

/// Spawns the live decoder, archiver, retention scheduler and historical
/// dispatcher, then runs the ingest loop in the current thread. Only
/// returns on a fatal initialisation error.
pub fn run(store: Store, config: PipelineConfig) -> Result<()> {
    let ring = MemoryRing::new(store.clone(), &config.device_id, config.memory_buffer);

    let live = live::spawn(store.clone(), config.device_id.clone())?;

    let archiver = match &config.disk_path {
        Some(root) => {
            let archiver = Archiver::spawn(root, &config.device_id)?;
            retention::spawn(root.join(&config.device_id), config.retention)?;
            Some(archiver)
        }
        None => {
            info!("no disk path configured, archiving disabled");
            None
        }
    };

    history::spawn(
        store.clone(),
        config.device_id.clone(),
        ring.clone(),
        config.memory_scale.clone(),
    )?;

    Ingestor {
        store,
        ring,
        live,
        archiver,
        config: IngestConfig {
            device_id: config.device_id,
            rtsp_url: config.rtsp_url,
            rtmp_url: config.rtmp_url,
        },
    }
    .run()
}
