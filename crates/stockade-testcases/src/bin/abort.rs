//! Dies of SIGABRT

fn main() {
    std::process::abort();
}
