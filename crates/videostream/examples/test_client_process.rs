// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// Connects to a host (see `test_host_process`) and consumes every frame it
// announces: waits, locks, maps, and unlocks each one, reporting throughput.

use std::time::Instant;
use videostream::client::{Client, Reconnect};
use videostream::timestamp;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let socket_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/tmp/videostream_process_test.sock".to_string());
    let frame_count: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(100);

    // Give the host a head start binding the socket.
    std::thread::sleep(std::time::Duration::from_millis(200));

    println!("[CLIENT] connecting to {socket_path}");
    let client = Client::connect(&socket_path, 0, Reconnect::Yes)?;
    println!("[CLIENT] connected");

    let mut received = 0usize;
    let mut total_bytes = 0u64;
    let start = Instant::now();

    while received < frame_count {
        let deadline = timestamp()? + 5_000_000_000; // 5 second deadline per frame
        let frame = match client.wait(deadline) {
            Ok(frame) => frame,
            Err(err) => {
                println!("[CLIENT] wait failed: {err}");
                break;
            }
        };

        client.trylock(&frame)?;
        match client.finish_lock(&frame) {
            Ok(()) => {}
            Err(err) => {
                println!("[CLIENT] lock denied for frame {}: {err}", frame.serial());
                continue;
            }
        }

        total_bytes += frame.size();
        received += 1;
        if received <= 5 || received % 20 == 0 {
            println!(
                "[CLIENT] frame {} serial={} size={}",
                received,
                frame.serial(),
                frame.size()
            );
        }

        client.unlock(&frame)?;
    }

    let duration = start.elapsed();
    println!(
        "[CLIENT] received {received} frames in {:.2}s ({:.1} fps, {:.2} MB total)",
        duration.as_secs_f64(),
        received as f64 / duration.as_secs_f64(),
        total_bytes as f64 / 1_000_000.0
    );

    Ok(())
}
