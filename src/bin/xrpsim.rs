// Author: Lukas Bower
// Purpose: Drive the host driver core against the simulated DSP.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use xrp::sim::{SimBoard, SimPlatform, PAGES};
use xrp::wire::BufferFlags;
use xrp::{BufferSpec, DeviceConfig, DeviceFile, Heartbeat, InData, OutData, QueueRequest};

#[derive(Parser)]
#[command(name = "xrpsim", about = "Exercise the XRP host driver on a simulated DSP", version)]
struct Cli {
    /// Device configuration; the simulator layout is used when absent.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Protocol spoken by the simulated firmware.
    #[arg(long, default_value_t = 2)]
    protocol: u32,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Echo a payload through the common command namespace.
    Loopback {
        #[arg(default_value = "hello dsp")]
        payload: String,
    },
    /// Copy a buffer through the firmware and verify it.
    Copy {
        #[arg(long, default_value_t = 307_200)]
        size: u32,
    },
    /// Hammer the queues from several threads.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 100)]
        iterations: usize,
    },
    /// Show negotiated state and the firmware log.
    Info,
}

fn board(cli: &Cli) -> Result<SimBoard> {
    let platform = match &cli.config {
        Some(path) => {
            let config = DeviceConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?;
            SimPlatform::with_config(config, PAGES).context("building simulated board")?
        }
        None => SimPlatform::new(),
    };
    platform.install_firmware(cli.protocol);
    SimBoard::boot(platform).context("probing device")
}

fn copy(board: &SimBoard, size: u32) -> Result<()> {
    let file = DeviceFile::open(Arc::clone(&board.device))?;
    let space = board.space.as_ref();
    let src = file.alloc(space, u64::from(size))?;
    let dst = file.alloc(space, u64::from(size))?;
    let pattern: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    xrp::share::AddressSpace::copy_to_user(space, src, &pattern)?;

    let request = QueueRequest {
        flags: Default::default(),
        nsid: None,
        in_data: InData::Kernel(Vec::new()),
        out_data: OutData::Kernel { size: 0 },
        buffers: vec![
            BufferSpec {
                flags: BufferFlags::READ,
                addr: src,
                size,
            },
            BufferSpec {
                flags: BufferFlags::WRITE,
                addr: dst,
                size,
            },
        ],
    };
    let started = Instant::now();
    file.submit(space, &request)?;
    let elapsed = started.elapsed();

    let mut copied = vec![0; size as usize];
    xrp::share::AddressSpace::copy_from_user(space, dst, &mut copied)?;
    ensure!(copied == pattern, "copied buffer differs from the source");
    println!("copied {size} bytes in {elapsed:?}");
    file.free(space, src)?;
    file.free(space, dst)?;
    Ok(())
}

fn stress(board: &SimBoard, threads: usize, iterations: usize) -> Result<()> {
    let started = Instant::now();
    let failures: usize = thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|worker| {
                let device = &board.device;
                scope.spawn(move || {
                    let mut failures = 0;
                    for round in 0..iterations {
                        let payload = format!("{worker}:{round}");
                        match device.loopback_test(payload.as_bytes()) {
                            Ok(echo) if echo == payload.as_bytes() => {}
                            Ok(_) => failures += 1,
                            Err(err) => {
                                warn!("[stress] worker {worker}: {err}");
                                failures += 1;
                            }
                        }
                    }
                    failures
                })
            })
            .collect();
        workers.into_iter().map(|w| w.join().unwrap_or(iterations)).sum()
    });
    let stats = board.dsp.stats();
    println!(
        "{} requests in {:?}, {} overlapping, {} failed",
        threads * iterations,
        started.elapsed(),
        stats.overlaps,
        failures
    );
    if failures > 0 {
        bail!("{failures} request(s) failed");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let board = board(&cli)?;
    info!(
        "[xrpsim] {} up, protocol {:?}, {} queue(s)",
        board.device.node_name(),
        board.device.protocol(),
        board.device.queue_count()
    );
    let _heartbeat = match board.device.config().heartbeat_period() {
        Some(period) => Some(Heartbeat::start(Arc::clone(&board.device), period, |err| {
            warn!("[xrpsim] heartbeat failed: {err}");
        })?),
        None => None,
    };

    match cli.command {
        Commands::Loopback { payload } => {
            let echo = board.device.loopback_test(payload.as_bytes())?;
            println!("{}", String::from_utf8_lossy(&echo));
        }
        Commands::Copy { size } => copy(&board, size)?,
        Commands::Stress {
            threads,
            iterations,
        } => stress(&board, threads, iterations)?,
        Commands::Info => {
            println!("node:     {}", board.device.node_name());
            println!("protocol: {:?}", board.device.protocol());
            println!("queues:   {}", board.device.queue_count());
            println!("dsp:      {:?}", board.dsp.stats());
            for line in board.device.panic_log().history() {
                println!("fw: {line}");
            }
        }
    }
    Ok(())
}
