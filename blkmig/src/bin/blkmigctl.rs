//! Demo CLI driving a migration attempt end to end against file-backed devices
//! and a TCP transport. Stands in for the outer migration engine; not itself
//! part of the wire protocol.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;

use blkmig::{BlockDriver, FileBlockDriver, MigrationParams, Migration, TcpTransport};
use tracing::info;

fn usage() -> ! {
    eprintln!(
        "usage:\n  blkmigctl send <listen-addr> <device-path>... [--shared] [--sparse] [--rate-bytes-per-sec N] [--max-downtime-secs N]\n  blkmigctl recv <connect-addr> <device-path>..."
    );
    std::process::exit(2)
}

fn main() {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let mode = args.next().unwrap_or_else(|| usage());

    match mode.as_str() {
        "send" => run_send(args),
        "recv" => run_recv(args),
        _ => usage(),
    }
}

fn run_send(mut args: impl Iterator<Item = String>) {
    let addr = args.next().unwrap_or_else(|| usage());
    let mut device_paths = Vec::new();
    let mut shared = false;
    let mut sparse = false;
    let mut rate_bytes_per_sec: u64 = 50_000_000;
    let mut max_downtime_secs: f64 = 0.3;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--shared" => shared = true,
            "--sparse" => sparse = true,
            "--rate-bytes-per-sec" => {
                rate_bytes_per_sec = args.next().unwrap_or_else(|| usage()).parse().unwrap_or_else(|_| usage())
            }
            "--max-downtime-secs" => {
                max_downtime_secs = args.next().unwrap_or_else(|| usage()).parse().unwrap_or_else(|_| usage())
            }
            path => device_paths.push(path.to_string()),
        }
    }
    if device_paths.is_empty() {
        usage();
    }

    let devices: Vec<Arc<dyn BlockDriver>> = device_paths
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let name = format!("vd{}", (b'a' + i as u8) as char);
            Arc::new(FileBlockDriver::open(name, path).expect("open device")) as Arc<dyn BlockDriver>
        })
        .collect();

    info!(%addr, device_count = devices.len(), "waiting for destination to connect");
    let listener = TcpListener::bind(&addr).expect("bind");
    let (stream, peer) = listener.accept().expect("accept");
    info!(%peer, "destination connected");

    let mut t = TcpTransport::new(stream, rate_bytes_per_sec).expect("transport");
    let params = MigrationParams { blk: true, shared, sparse };

    let mut mig = Migration::setup(devices, params, max_downtime_secs, &mut t).expect("setup");
    loop {
        let converged = mig.iterate(&mut t).expect("iterate");
        println!("iterate: converged={converged}");
        if converged {
            break;
        }
    }
    mig.complete(&mut t).expect("complete");
    println!("migration complete");
}

fn run_recv(mut args: impl Iterator<Item = String>) {
    let addr = args.next().unwrap_or_else(|| usage());
    let device_paths: Vec<String> = args.collect();
    if device_paths.is_empty() {
        usage();
    }

    let devices: Vec<Arc<dyn BlockDriver>> = device_paths
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let name = format!("vd{}", (b'a' + i as u8) as char);
            Arc::new(FileBlockDriver::open(name, path).expect("open device")) as Arc<dyn BlockDriver>
        })
        .collect();

    info!(%addr, device_count = devices.len(), "connecting to source");
    let stream = TcpStream::connect(&addr).expect("connect");
    let mut t = TcpTransport::new(stream, u64::MAX).expect("transport");

    let mut recv = blkmig::Receiver::new(devices);
    loop {
        recv.load_phase(&mut t).expect("load phase");
        if recv.progress_log().last() == Some(&100) {
            break;
        }
    }
    println!("load complete");
}
