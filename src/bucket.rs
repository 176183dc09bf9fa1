//! Size classes. Free blocks are distributed among [`CLASS_COUNT`] buckets
//! depending on their size, so that finding a block for a small request
//! doesn't require walking past every big block in the heap and vice versa.

/// Number of size classes, and therefore number of free list heads stored in
/// the heap prologue.
pub(crate) const CLASS_COUNT: usize = 14;

/// Inclusive upper bound of each size class except the last one, which
/// takes everything bigger than `CLASS_LIMITS[CLASS_COUNT - 2]`. Sizes are
/// block sizes, tags included. Small classes are spaced by one double word
/// because small requests are the most common, after that they double.
pub(crate) const CLASS_LIMITS: [usize; CLASS_COUNT - 1] = [
    8, 16, 24, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384,
];

/// Returns the index of the bucket where a block of `size` bytes belongs.
/// The mapping is monotonic: bigger sizes never map to smaller buckets, so
/// scanning buckets upwards from `bucket_for(n)` visits every block that
/// could possibly fit `n` bytes.
pub(crate) fn bucket_for(size: usize) -> usize {
    for (i, limit) in CLASS_LIMITS.iter().enumerate() {
        if size <= *limit {
            return i;
        }
    }

    CLASS_COUNT - 1
}
