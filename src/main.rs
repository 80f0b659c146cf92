mod config;

use anyhow::Result;
use camgate_store::Store;
use clap::Parser;
use tracing::info;

use config::Config;

fn main() -> Result<()> {
    let config = Config::parse();
    camgate_util::log::init();
    camgate_video::init();

    info!(
        device_id = %config.device_id,
        rtsp = %config.rtsp,
        rtmp = config.rtmp.as_deref().unwrap_or("disabled"),
        "starting device pipeline"
    );

    let store = Store::new();
    camgate_video::pipeline::run(store, config.into_pipeline_config()?)
}
