use streamquant::init_thread_pool;

#[cfg(test)]
use pretty_assertions::assert_eq;

// Kept alone in this file: the global pool can only be built once per process
#[test]
fn single_thread_pool() {
    init_thread_pool(1);
    assert_eq!(rayon::current_num_threads(), 1);

    // later calls leave the pool as it is
    init_thread_pool(4);
    assert_eq!(rayon::current_num_threads(), 1);
}
