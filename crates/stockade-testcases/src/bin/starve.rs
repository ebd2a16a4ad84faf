//! Keeps every CPU busy with threads that never block

fn main() {
    let threads = std::thread::available_parallelism().map_or(4, usize::from) * 2;
    let workers: Vec<_> = (0..threads)
        .map(|_| {
            std::thread::spawn(|| {
                let mut x = 0u64;
                loop {
                    x = std::hint::black_box(x.wrapping_add(1));
                }
            })
        })
        .collect();
    for worker in workers {
        let _ = worker.join();
    }
}
