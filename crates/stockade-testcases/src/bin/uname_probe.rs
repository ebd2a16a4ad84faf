//! Exits with the errno `uname` fails with, or 0 when it succeeds

fn main() {
    let mut buf = std::mem::MaybeUninit::<libc::utsname>::zeroed();
    // SAFETY: uname writes into the buffer
    let ret = unsafe { libc::uname(buf.as_mut_ptr()) };
    let code = if ret == 0 {
        0
    } else {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(1)
    };
    std::process::exit(code);
}
