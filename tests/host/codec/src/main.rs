//! Frame loop that records asynchronous texture encodes to disk.
//!
//! Every frame uploads a synthetic RGBA frame as a texture, submits it for
//! asynchronous encoding and ticks the scheduler. Finished tasks are drained
//! in submission order at the start of the next frame and their bytes are
//! appended to the output file.
//!
//! Usage: `pipekit-encode-to-disk [output] [frames]`

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use pipekit_codec::sys::SoftwareEngine;
use pipekit_codec::{
    CodecError, CodecType, Compression, Encoder, EncoderConfig, PixelFormat, Scheduler,
    SchedulerConfig, TaskHandle, TextureRef,
};

const WIDTH: u32 = 500;
const HEIGHT: u32 = 500;
const TARGET_FPS: u32 = 30;
const FRAME_INTERVAL: Duration = Duration::from_millis(1000 / TARGET_FPS as u64);
const ENGINE_LATENCY: Duration = Duration::from_millis(20);
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_OUTPUT: &str = "ExampleRawStream.bin";
const DEFAULT_FRAMES: u32 = 150;

#[derive(Default)]
struct Stats {
    written_frames: usize,
    written_bytes: usize,
    failed: usize,
    dropped: usize,
}

/// Horizontal bands that scroll one row per frame.
fn synthetic_frame(index: u32) -> Vec<u8> {
    let row_bytes = PixelFormat::Rgba32.row_pitch(WIDTH);
    let mut pixels = Vec::with_capacity(row_bytes * HEIGHT as usize);
    for y in 0..HEIGHT {
        let band = ((y + index) / 16 % 8) as u8;
        let rgba = [band * 32, 255 - band * 32, band * 16, 255];
        for _ in 0..WIDTH {
            pixels.extend_from_slice(&rgba);
        }
    }
    pixels
}

fn drain(
    tasks: &mut VecDeque<TaskHandle>,
    out: &mut impl Write,
    stats: &mut Stats,
) -> std::io::Result<()> {
    while tasks.front().is_some_and(TaskHandle::is_done) {
        let Some(task) = tasks.pop_front() else {
            break;
        };
        match task.data() {
            Ok(data) => {
                out.write_all(&data)?;
                stats.written_frames += 1;
                stats.written_bytes += data.len();
            }
            Err(_) => {
                error!(
                    "encoder encountered error: {}",
                    task.error().unwrap_or_default()
                );
                stats.failed += 1;
            }
        }
        task.dispose();
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let output = args.next().unwrap_or_else(|| DEFAULT_OUTPUT.to_string());
    let frames = match args.next() {
        Some(frames) => frames.parse()?,
        None => DEFAULT_FRAMES,
    };

    let engine = Arc::new(SoftwareEngine::with_latency(ENGINE_LATENCY));
    let scheduler = Scheduler::new(engine.clone(), SchedulerConfig::default());
    let config = EncoderConfig::new(WIDTH, HEIGHT)
        .with_codec(CodecType::H264)
        .with_format(PixelFormat::Rgba32)
        .with_compression(Compression::Lossy)
        .with_bitrate_mbps(10.0, TARGET_FPS)
        .with_texture_input(true);
    let mut encoder = Encoder::new(&scheduler, config)?;
    let texture = TextureRef::rgba32(1, WIDTH, HEIGHT);

    let mut out = BufWriter::new(File::create(&output)?);
    let mut tasks = VecDeque::new();
    let mut stats = Stats::default();

    println!("Encoding {frames} frames of {WIDTH}x{HEIGHT} to {output}");
    let start = Instant::now();

    for index in 0..frames {
        let frame_start = Instant::now();

        // Update
        drain(&mut tasks, &mut out, &mut stats)?;

        // Render
        engine.upload_texture(&texture, synthetic_frame(index))?;
        match encoder.encode_texture_async(&texture, false) {
            Ok(task) => tasks.push_back(task),
            Err(CodecError::QueueFull(limit)) => {
                warn!("frame {index} dropped: {limit} tasks already in flight");
                stats.dropped += 1;
            }
            Err(err) => return Err(err.into()),
        }
        scheduler.tick();

        if let Some(rest) = FRAME_INTERVAL.checked_sub(frame_start.elapsed()) {
            thread::sleep(rest);
        }
    }

    let deadline = Instant::now() + FLUSH_TIMEOUT;
    while !tasks.is_empty() && Instant::now() < deadline {
        scheduler.tick();
        drain(&mut tasks, &mut out, &mut stats)?;
        thread::sleep(Duration::from_millis(1));
    }
    if !tasks.is_empty() {
        warn!("{} task(s) still pending at shutdown", tasks.len());
    }

    encoder.close();
    out.flush()?;
    info!("{} live task record(s) after close", scheduler.live_tasks());

    let elapsed = start.elapsed();
    println!("\n=================================================");
    println!("             RECORDING COMPLETE");
    println!("=================================================");
    println!("Duration:       {:.1}s", elapsed.as_secs_f64());
    println!("Frames written: {}", stats.written_frames);
    println!("Bytes written:  {}", stats.written_bytes);
    println!("Failed:         {}", stats.failed);
    println!("Dropped:        {}", stats.dropped);
    println!("Output:         {output}");
    Ok(())
}
