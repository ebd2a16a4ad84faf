//! Opens the comms channel and drops it without installing the policy,
//! then keeps running unfiltered

use std::time::Duration;
use stockade_core::client::Client;

fn main() {
    match Client::from_env() {
        Ok(client) => drop(client),
        Err(e) => {
            eprintln!("no comms channel: {e}");
            std::process::exit(2);
        }
    }
    std::thread::sleep(Duration::from_secs(30));
}
