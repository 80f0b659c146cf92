pub mod archive;
pub mod codec;
pub mod egress;
pub mod frame;
pub mod gop;
pub mod history;
pub mod ingest;
pub mod keys;
pub mod live;
pub mod pipeline;
pub mod retention;
pub mod ring;
pub mod settings;

pub fn init() {
    ffmpeg::init().expect("failed to init ffmpeg");
}
