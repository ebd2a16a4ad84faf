//! Forks a sleeping child, reports its own pid and the child's on stdout,
//! then sleeps too

use std::io::Write;
use std::time::Duration;

fn main() {
    // SAFETY: single-threaded at this point; the child only sleeps
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        std::process::exit(2);
    }
    if pid == 0 {
        std::thread::sleep(Duration::from_secs(600));
        std::process::exit(0);
    }
    let mut stdout = std::io::stdout();
    if writeln!(stdout, "{} {pid}", std::process::id()).and_then(|()| stdout.flush()).is_err() {
        std::process::exit(3);
    }
    std::thread::sleep(Duration::from_secs(600));
}
