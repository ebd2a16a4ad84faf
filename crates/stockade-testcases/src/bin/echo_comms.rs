//! Installs its policy, then answers each message from the caller with
//! the same bytes reversed until the caller sends an empty frame

use stockade_core::client::Client;

fn main() {
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

    loop {
        let mut frame = match client.comms().recv_frame() {
            Ok(frame) => frame,
            Err(e) => {
                eprintln!("receive failed: {e}");
                std::process::exit(4);
            }
        };
        if frame.is_empty() {
            return;
        }
        frame.reverse();
        if let Err(e) = client.comms().send_frame(&frame) {
            eprintln!("send failed: {e}");
            std::process::exit(5);
        }
    }
}
