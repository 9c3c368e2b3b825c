#[cfg(windows)]
use std::{
    io::{self, Write},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
    },
    time::{Duration, Instant},
};

use clap::Parser;
#[cfg(windows)]
use screen_stream::{
    capture::ScreenStream,
    frame::frame_channel,
};

#[derive(Parser)]
#[command(name = "Screen Stream")]
#[command(version = "0.1")]
#[command(about = "Captures a display and reports the delivered frame rate")]
struct Cli {
    /// List the displays and exit
    #[arg(long)]
    list: bool,

    /// Display id to capture, defaults to the primary display
    #[arg(long)]
    display: Option<usize>,

    /// Target frame rate
    #[arg(long, default_value_t = 30)]
    frame_rate: u32,

    /// Seconds to capture for, Ctrl+C stops earlier
    #[arg(long, default_value_t = 5)]
    seconds: u64,

    /// Frame rate to switch to halfway through the capture
    #[arg(long)]
    switch_rate: Option<i32>,

    /// Log level: error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    log_level: tracing_subscriber::filter::LevelFilter,
}

#[cfg(windows)]
fn main() {
    let cli = Cli::parse();

    // Forwards the library's log records
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let stream = ScreenStream::dxgi();
    let displays = stream.enumerate().expect("Failed to enumerate displays");
    for display in &displays {
        println!("{display}");
    }

    if cli.list {
        return;
    }

    let display_id = match cli.display {
        Some(display_id) => display_id,
        None => displays.iter().find(|display| display.is_primary()).map_or(0, |display| display.id()),
    };

    let stop_flag = Arc::new(AtomicBool::new(false));

    // Set up Ctrl+C handler
    {
        let stop_flag = stop_flag.clone();
        ctrlc::set_handler(move || {
            stop_flag.store(true, Ordering::SeqCst);
        })
        .expect("Error setting Ctrl-C handler");
    }

    // Keep a few frames queued so printing never stalls the capture thread
    let (handler, frames) = frame_channel(4);
    stream.start(display_id, cli.frame_rate, handler).expect("Screen Capture Failed");

    let start = Instant::now();
    let duration = Duration::from_secs(cli.seconds);
    let mut switched = false;

    while !stop_flag.load(Ordering::SeqCst) && start.elapsed() < duration {
        if let Some(frame_rate) = cli.switch_rate {
            if !switched && start.elapsed() >= duration / 2 {
                println!("\nSwitching to {frame_rate} FPS");
                stream.set_frame_rate(frame_rate);
                switched = true;
            }
        }

        match frames.recv_timeout(Duration::from_millis(250)) {
            Ok(frame) => {
                print!(
                    "\rFrame {} | {}x{} | FPS: {:.2}",
                    frame.sequence,
                    frame.width,
                    frame.height,
                    stream.measured_frame_rate().unwrap_or_default()
                );
                io::stdout().flush().expect("Failed to flush stdout");
            }
            Err(RecvTimeoutError::Timeout) => {
                if stream.is_finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    stream.stop().expect("Failed to stop the capture");
    println!(
        "\nCaptured {} frames in {:.2} seconds ({})",
        stream.frames_delivered(),
        start.elapsed().as_secs_f64(),
        stream.exit_reason().map_or_else(|| "not started".to_string(), |reason| reason.to_string())
    );
}

#[cfg(not(windows))]
fn main() {
    let _ = Cli::parse();

    eprintln!("Desktop duplication is only available on Windows");
    std::process::exit(1);
}
