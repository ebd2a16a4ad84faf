//! Exits 0 right away

fn main() {}
