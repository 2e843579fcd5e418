//! [Prometheus][prometheus]用のメトリクス.
//!
//! [prometheus]: https://prometheus.io/
use prometrics::metrics::{Counter, MetricBuilder};

/// メモリプールのメトリクス.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    pub(crate) inserted_free_blocks: Counter,
    pub(crate) removed_free_blocks: Counter,
    pub(crate) allocated_blocks: Counter,
    pub(crate) allocated_bytes: Counter,
    pub(crate) released_blocks: Counter,
    pub(crate) released_bytes: Counter,
    pub(crate) backing_allocations: Counter,
    pub(crate) backing_allocated_bytes: Counter,
    pub(crate) merged_blocks: Counter,
    pub(crate) unknown_pointer_releases: Counter,
}
impl PoolMetrics {
    /// フリーチェーンに挿入されたブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_inserted_free_blocks_total <COUNTER>
    /// ```
    pub fn inserted_free_blocks(&self) -> u64 {
        self.inserted_free_blocks.value() as u64
    }

    /// フリーチェーンから削除されたブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_removed_free_blocks_total <COUNTER>
    /// ```
    pub fn removed_free_blocks(&self) -> u64 {
        self.removed_free_blocks.value() as u64
    }

    /// フリーチェーンの現在の長さ.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_inserted_free_blocks_total - dynapool_pool_removed_free_blocks_total
    /// ```
    pub fn free_list_len(&self) -> usize {
        // NOTE: 以下の順番で値を取得しないとアンダーフローする可能性がある
        let dec = self.removed_free_blocks();
        let inc = self.inserted_free_blocks();
        (inc - dec) as usize
    }

    /// 貸出の実行回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_allocated_blocks_total <COUNTER>
    /// ```
    pub fn allocated_blocks(&self) -> u64 {
        self.allocated_blocks.value() as u64
    }

    /// これまでに貸し出したバイト数の合計.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_allocated_bytes_total <COUNTER>
    /// ```
    pub fn allocated_bytes(&self) -> u64 {
        self.allocated_bytes.value() as u64
    }

    /// 返却の実行回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_released_blocks_total <COUNTER>
    /// ```
    pub fn released_blocks(&self) -> u64 {
        self.released_blocks.value() as u64
    }

    /// これまでに返却されたバイト数の合計.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_released_bytes_total <COUNTER>
    /// ```
    pub fn released_bytes(&self) -> u64 {
        self.released_bytes.value() as u64
    }

    /// バッキングヒープへの割当要求の回数.
    ///
    /// この値が小さいほど、プールによる償却が効いていることを意味する.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_backing_allocations_total <COUNTER>
    /// ```
    pub fn backing_allocations(&self) -> u64 {
        self.backing_allocations.value() as u64
    }

    /// バッキングヒープから確保したバイト数の合計.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_backing_allocated_bytes_total <COUNTER>
    /// ```
    pub fn backing_allocated_bytes(&self) -> u64 {
        self.backing_allocated_bytes.value() as u64
    }

    /// 返却時の併合によって削除されたブロックの数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_merged_blocks_total <COUNTER>
    /// ```
    pub fn merged_blocks(&self) -> u64 {
        self.merged_blocks.value() as u64
    }

    /// 貸出中ではないポインタに対する返却要求の回数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_unknown_pointer_releases_total <COUNTER>
    /// ```
    pub fn unknown_pointer_releases(&self) -> u64 {
        self.unknown_pointer_releases.value() as u64
    }

    /// 現在の貸出中バイト数.
    ///
    /// # Prometheus
    ///
    /// ```prometheus
    /// dynapool_pool_allocated_bytes_total - dynapool_pool_released_bytes_total
    /// ```
    pub fn usage_bytes(&self) -> u64 {
        // NOTE: 以下の順番で値を取得しないとアンダーフローする可能性がある
        let dec = self.released_bytes();
        let inc = self.allocated_bytes();
        inc - dec
    }

    pub(crate) fn new(builder: &MetricBuilder) -> Self {
        let mut builder = builder.clone();
        builder.namespace("dynapool").subsystem("pool");
        PoolMetrics {
            inserted_free_blocks: builder
                .counter("inserted_free_blocks_total")
                .help("Number of blocks inserted into the free chain")
                .finish()
                .expect("Never fails"),
            removed_free_blocks: builder
                .counter("removed_free_blocks_total")
                .help("Number of blocks removed from the free chain")
                .finish()
                .expect("Never fails"),
            allocated_blocks: builder
                .counter("allocated_blocks_total")
                .help("Number of loans handed out by the pool")
                .finish()
                .expect("Never fails"),
            allocated_bytes: builder
                .counter("allocated_bytes_total")
                .help("Number of bytes handed out by the pool")
                .finish()
                .expect("Never fails"),
            released_blocks: builder
                .counter("released_blocks_total")
                .help("Number of loans returned to the pool")
                .finish()
                .expect("Never fails"),
            released_bytes: builder
                .counter("released_bytes_total")
                .help("Number of bytes returned to the pool")
                .finish()
                .expect("Never fails"),
            backing_allocations: builder
                .counter("backing_allocations_total")
                .help("Number of allocation requests issued to the backing heap")
                .finish()
                .expect("Never fails"),
            backing_allocated_bytes: builder
                .counter("backing_allocated_bytes_total")
                .help("Number of bytes reserved from the backing heap")
                .finish()
                .expect("Never fails"),
            merged_blocks: builder
                .counter("merged_blocks_total")
                .help("Number of blocks removed by coalescing adjacent free blocks")
                .finish()
                .expect("Never fails"),
            unknown_pointer_releases: builder
                .counter("unknown_pointer_releases_total")
                .help("Number of deallocation requests for pointers not loaned out")
                .finish()
                .expect("Never fails"),
        }
    }

    pub(crate) fn count_allocation(&self, size: usize) {
        self.allocated_blocks.increment();
        self.allocated_bytes.add_u64(size as u64);
    }

    pub(crate) fn count_releasion(&self, size: usize) {
        self.released_blocks.increment();
        self.released_bytes.add_u64(size as u64);
    }
}
