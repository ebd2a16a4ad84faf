//! Installs its policy over the comms channel while other threads run,
//! then checks that every thread is still alive

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stockade_core::client::Client;

fn main() {
    let stop = Arc::new(AtomicBool::new(false));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            })
        })
        .collect();

    let mut client = match Client::from_env() {
        Ok(client) => client,
        Err(e) => {
            eprintln!("no comms channel: {e}");
            std::process::exit(2);
        }
    };
    if let Err(e) = client.sandbox_me_here() {
        eprintln!("policy install failed: {e}");
        std::process::exit(3);
    }

    stop.store(true, Ordering::Relaxed);
    for worker in workers {
        if worker.join().is_err() {
            std::process::exit(4);
        }
    }
}
