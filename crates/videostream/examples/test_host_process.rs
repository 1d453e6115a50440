// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies
//
// Publishes synthetic NV12 frames on a socket so a separately-launched
// `test_client_process` (or any other client) can exercise the full
// lock/map/unlock cycle against a real host.

use std::time::Instant;
use videostream::fourcc::FourCC;
use videostream::frame::Frame;
use videostream::host::Host;
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
    let width = 1280u32;
    let height = 720u32;

    println!("[HOST] binding {socket_path}");
    let host = Host::new(&socket_path)?;

    // Give a client launched alongside this process time to connect.
    std::thread::sleep(std::time::Duration::from_millis(500));

    let start = Instant::now();
    for i in 0..frame_count {
        let frame = Frame::construct(width, height, width * 3 / 2, FourCC(*b"NV12"), 0, None);
        frame.alloc(None)?;
        {
            let view = frame.map()?;
            // Fill with a value that changes frame to frame so a client can
            // sanity-check it received a fresh buffer, not a stale mapping.
            view.as_mut_slice().fill((i % 256) as u8);
        }

        let now = timestamp()?;
        let expires = now + 2_000_000_000; // 2 second expiration
        let serial = host.publish(frame, expires, -1, -1, -1)?;

        host.poll(10)?;
        host.process()?;

        if i < 5 || i % 20 == 0 {
            println!("[HOST] published frame {serial} ({}x{})", width, height);
        }
    }

    let duration = start.elapsed();
    println!(
        "[HOST] published {frame_count} frames in {:.2}s ({:.1} fps)",
        duration.as_secs_f64(),
        frame_count as f64 / duration.as_secs_f64()
    );

    println!("[HOST] draining remaining client activity...");
    for _ in 0..100 {
        host.poll(10)?;
        host.process()?;
    }

    println!("[HOST] done");
    Ok(())
}
