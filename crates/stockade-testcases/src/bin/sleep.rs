//! Sleeps far longer than any test waits

use std::time::Duration;

fn main() {
    std::thread::sleep(Duration::from_secs(600));
}
