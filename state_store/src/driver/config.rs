use std::sync::LazyLock;

/// The number of threads to start for flushing and compaction (default: 1)
pub(super) static ROCKSDB_THREAD_COUNT: LazyLock<i32> = LazyLock::new(|| {
    std::env::var("OCC_ROCKSDB_THREAD_COUNT")
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or(1)
});

/// The maximum number of write buffers which can be used (default: 2)
pub(super) static ROCKSDB_MAX_WRITE_BUFFER_NUMBER: LazyLock<i32> = LazyLock::new(|| {
    std::env::var("OCC_ROCKSDB_MAX_WRITE_BUFFER_NUMBER")
        .ok()
        .and_then(|s| s.parse::<i32>().ok())
        .unwrap_or(2)
});

/// The amount of data each write buffer can build up in memory (default: 32
/// MiB)
pub(super) static ROCKSDB_WRITE_BUFFER_SIZE: LazyLock<usize> = LazyLock::new(|| {
    std::env::var("OCC_ROCKSDB_WRITE_BUFFER_SIZE")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(32 * 1024 * 1024)
});

/// The maximum number of information log files to keep (default: 10)
pub(super) static ROCKSDB_KEEP_LOG_FILE_NUM: LazyLock<usize> = LazyLock::new(|| {
    std::env::var("OCC_ROCKSDB_KEEP_LOG_FILE_NUM")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(10)
});

/// Upper bound on lock stripes held by the transaction lock manager
/// (default: 16)
pub(super) static ROCKSDB_TXN_NUM_STRIPES: LazyLock<usize> = LazyLock::new(|| {
    std::env::var("OCC_ROCKSDB_TXN_NUM_STRIPES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(16)
});
