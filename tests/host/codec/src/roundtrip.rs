//! Synchronous encode/decode round trip.
//!
//! Each frame is encoded from a CPU buffer, decoded again by a second session
//! with the same parameters, and compared with the source.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error};
use pipekit_codec::sys::SoftwareEngine;
use pipekit_codec::{
    Compression, Decoder, DecoderConfig, Encoder, EncoderConfig, PixelFormat, Scheduler,
    SchedulerConfig,
};

const WIDTH: u32 = 500;
const HEIGHT: u32 = 500;
const FRAMES: u32 = 60;

fn gradient_frame(format: PixelFormat, index: u32) -> Vec<u8> {
    let pitch = format.row_pitch(WIDTH);
    let mut pixels = vec![0; pitch * HEIGHT as usize];
    for (y, row) in pixels.chunks_mut(pitch).enumerate() {
        row.fill(((y as u32 + index) % 251) as u8);
    }
    pixels
}

fn run(format: PixelFormat) -> Result<(), Box<dyn std::error::Error>> {
    let scheduler = Scheduler::new(Arc::new(SoftwareEngine::new()), SchedulerConfig::default());
    let config = EncoderConfig::new(WIDTH, HEIGHT)
        .with_format(format)
        .with_compression(Compression::Lossless);
    let mut encoder = Encoder::new(&scheduler, config.clone())?;
    let mut decoder = Decoder::new(&scheduler, DecoderConfig::from(&config))?;

    // Sized for the worst case; encoded frames are usually far smaller.
    let mut packet = vec![0; config.frame_size() * 2 + 64];
    let mut restored = vec![0; config.frame_size()];
    let mut encoded_total = 0;
    let mut mismatches = 0;

    let start = Instant::now();
    for index in 0..FRAMES {
        let frame = gradient_frame(format, index);
        let size = encoder.encode(&frame, &mut packet, index == 0)?;
        let written = decoder.decode(&packet[..size], &mut restored)?;
        debug!("frame {index}: {size} encoded bytes, {written} decoded bytes");
        encoded_total += size;
        if restored != frame {
            mismatches += 1;
            error!("frame {index} did not survive the round trip");
        }
    }
    let elapsed = start.elapsed();

    println!("\n=== {format:?} (pitch {} bytes) ===", config.pitch());
    println!("  Frames:        {FRAMES}");
    println!("  Frame size:    {} bytes", config.frame_size());
    println!(
        "  Avg encoded:   {} bytes",
        encoded_total / FRAMES as usize
    );
    println!("  Mismatches:    {mismatches}");
    println!(
        "  Frame time:    {:.2} ms",
        elapsed.as_secs_f64() * 1000.0 / f64::from(FRAMES)
    );
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    for format in [
        PixelFormat::Rgba32,
        PixelFormat::Uint4,
        PixelFormat::Uint8,
        PixelFormat::Uint16,
        PixelFormat::Uint32,
    ] {
        run(format)?;
    }
    Ok(())
}
