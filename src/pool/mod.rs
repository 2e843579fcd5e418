//! 可変長メモリプール本体.
//!
//! 主に[MemoryPool]構造体を提供する.
//!
//! プールは、バッキングヒープから確保した粗粒度の領域を、
//! ブロックチェーン(フリー・使用中)として管理し、
//! 利用者の要求に応じて部分範囲を切り出して貸し出す.
//!
//! [MemoryPool]: ./struct.MemoryPool.html
use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::cmp;
use std::ptr::{self, NonNull};
use std::sync::{Mutex, OnceLock};

use self::address_index::AddressIndex;
use self::block_list::{BlockList, Chain};
use crate::heap::{HeapMemory, LibcHeap};
use crate::metrics::PoolMetrics;
use crate::{Error, Result};

mod address_index;
mod arena;
mod block_list;

/// プロセス全体で共有される`MemoryPool`インスタンス.
static GLOBAL_POOL: OnceLock<MemoryPool> = OnceLock::new();

/// `MemoryPool`のビルダ.
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    min_bytes: usize,
    logger: Logger,
    metrics: MetricBuilder,
}
impl PoolBuilder {
    /// デフォルト設定で`PoolBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        PoolBuilder {
            min_bytes: 256,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// 一度のバッキング割当の最小バイト数を設定する.
    ///
    /// バッキングヒープへの全ての要求は、少なくともこの値まで切り上げられる.
    /// 値を大きくするほどヒープ呼び出しは減るが、
    /// その分、割当毎に余る空き領域は増える(内部フラグメンテーションとのトレードオフ).
    ///
    /// デフォルト値は`256`.
    pub fn min_bytes(&mut self, n: usize) -> &mut Self {
        self.min_bytes = n;
        self
    }

    /// プール用のloggerを登録する.
    ///
    /// デフォルト値は`Logger::root(Discard, o!())`.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// デフォルトのバッキングヒープ([LibcHeap])を用いてプールを生成する.
    ///
    /// [LibcHeap]: ../heap/struct.LibcHeap.html
    pub fn build(&self) -> MemoryPool<LibcHeap> {
        self.build_with(LibcHeap)
    }

    /// 指定されたバッキングヒープを用いてプールを生成する.
    pub fn build_with<H: HeapMemory>(&self, heap: H) -> MemoryPool<H> {
        MemoryPool {
            inner: Mutex::new(PoolInner {
                list: BlockList::new(self.min_bytes, PoolMetrics::new(&self.metrics)),
                index: AddressIndex::new(),
                alloc_bytes: 0,
                heap,
            }),
            logger: self.logger.clone(),
        }
    }
}
impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// ロック配下で管理される可変状態の一式.
#[derive(Debug)]
struct PoolInner<H> {
    list: BlockList,
    index: AddressIndex,
    alloc_bytes: usize,
    heap: H,
}

/// 可変長メモリプール.
///
/// バッキングヒープへの呼び出し回数を抑えるために、
/// 粗粒度に確保した領域から要求バイト範囲を切り出して貸し出すサブアロケータ.
///
/// 全ての操作は、インスタンス毎の単一のロックにより直列化される.
/// 利用者側での追加の同期は不要だが、
/// クリティカルセクション内から同一インスタンスを再帰的に呼び出してはいけない.
///
/// # Examples
///
/// ```
/// use dynapool::PoolBuilder;
///
/// let pool = PoolBuilder::new().min_bytes(256).build();
///
/// let ptr = pool.allocate(64).unwrap();
/// assert_eq!(pool.allocated_size(), 64);
///
/// assert!(pool.deallocate(ptr.as_ptr()));
/// assert_eq!(pool.allocated_size(), 0);
/// ```
#[derive(Debug)]
pub struct MemoryPool<H = LibcHeap>
where
    H: HeapMemory,
{
    inner: Mutex<PoolInner<H>>,
    logger: Logger,
}

// `PoolInner`内の生ポインタ群は、全て`Mutex`配下でのみ操作される
unsafe impl<H: HeapMemory + Send> Send for MemoryPool<H> {}
unsafe impl<H: HeapMemory + Send> Sync for MemoryPool<H> {}

impl MemoryPool {
    /// プロセス全体で共有されるプールインスタンスを返す.
    ///
    /// 最初の呼び出し時に、デフォルト設定(`PoolBuilder::new()`)で一度だけ初期化される.
    ///
    /// あくまで利便性のためのアクセサであり、
    /// 独立した設定やロックが必要な場合には`PoolBuilder`で個別のインスタンスを生成すれば良い.
    pub fn global() -> &'static MemoryPool {
        GLOBAL_POOL.get_or_init(|| PoolBuilder::new().build())
    }
}
impl<H: HeapMemory> MemoryPool<H> {
    /// `size`バイトの範囲を貸し出す.
    ///
    /// 返された範囲の先頭`size`バイトはゼロ初期化されている.
    /// 内部のブロックが`size`より大きいことがあっても、
    /// 利用者が`size`を超えるバイトに依存してはいけない.
    ///
    /// `size`が`0`の場合には`1`に正規化される(ゼロ長の貸出はモデル上存在しない).
    ///
    /// # Errors
    ///
    /// - バッキングヒープが領域を供給できない場合: `ErrorKind::HeapExhausted`
    /// - ディスクリプタ用スロットを確保できない場合: `ErrorKind::DescriptorExhausted`
    ///
    /// どちらの場合もプールの状態は変更されておらず、
    /// 貸出中の範囲を返却してから再試行することが可能.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        let mut guard = self.inner.lock().map_err(Error::from)?;
        let inner = &mut *guard;
        let size = cmp::max(size, 1);

        let best = match inner.list.find_usable_block(size) {
            Some(id) => id,
            None => {
                debug!(self.logger, "No usable free block; requesting a new backing allocation";
                       "size" => size);
                track!(inner.list.allocate_block(&mut inner.heap, size))?
            }
        };
        track!(inner.list.split_block(best, size))?;
        inner.list.push_used(best);

        let data = inner.list.block_data(best);
        inner.index.insert(data.as_ptr(), best);
        inner.alloc_bytes += size;
        inner.list.metrics().count_allocation(size);

        unsafe { ptr::write_bytes(data.as_ptr(), 0, size) };
        Ok(data)
    }

    /// 貸出中の範囲を返却する.
    ///
    /// `ptr`が貸出中のポインタではない場合(二重返却を含む)には、
    /// プールの状態は一切変更されず`false`が返される.
    /// 何度呼び出しても安全である.
    pub fn deallocate(&self, ptr: *mut u8) -> bool {
        let mut guard = self.inner.lock().expect("Never fails");
        let inner = &mut *guard;

        // ディスクリプタを構造的に解放する前にインデックスから外す
        let id = match inner.index.remove(ptr) {
            Some(id) => id,
            None => {
                inner.list.metrics().unknown_pointer_releases.increment();
                return false;
            }
        };
        let size = inner.list.block_size(id);
        inner.alloc_bytes -= size;
        inner.list.metrics().count_releasion(size);
        inner.list.release_block(id);
        true
    }

    /// 現在貸出中のバイト数を返す.
    pub fn allocated_size(&self) -> usize {
        self.inner.lock().expect("Never fails").alloc_bytes
    }

    /// プールが占有しているバイト数を返す.
    ///
    /// バッキングヒープから確保済みのバイト数に、
    /// ディスクリプタアリーナ自身のオーバーヘッドを加えた値.
    pub fn total_size(&self) -> usize {
        let guard = self.inner.lock().expect("Never fails");
        guard.list.total_bytes() + guard.list.reserved_bytes()
    }

    /// フリーチェーンの現在の長さを返す.
    pub fn num_free_blocks(&self) -> usize {
        self.inner
            .lock()
            .expect("Never fails")
            .list
            .chain_len(Chain::Free)
    }

    /// 使用中チェーンの現在の長さを返す.
    pub fn num_used_blocks(&self) -> usize {
        self.inner
            .lock()
            .expect("Never fails")
            .list
            .chain_len(Chain::Used)
    }

    /// プール用のメトリクスを返す.
    pub fn metrics(&self) -> PoolMetrics {
        self.inner.lock().expect("Never fails").list.metrics().clone()
    }

    /// チェーン不変条件の機械的検査(テスト用).
    #[cfg(test)]
    fn audit(&self) {
        let guard = self.inner.lock().expect("Never fails");
        guard.list.audit();
        assert_eq!(guard.index.len(), guard.list.chain_len(Chain::Used));
    }

    #[cfg(test)]
    fn free_bytes(&self) -> usize {
        self.inner.lock().expect("Never fails").list.free_bytes()
    }
}
impl<H: HeapMemory> Drop for MemoryPool<H> {
    /// 全てのブロックを解放し、バッキング割当をヒープへ返す.
    ///
    /// 未返却の貸出範囲は、単なるバイト数の回収として扱われる
    /// (プールは型のない範囲のみを扱うため、オブジェクト毎の破棄処理は存在しない).
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        let unreturned = inner.alloc_bytes;
        inner.list.release_all(&mut inner.heap);
        inner.alloc_bytes = 0;
        debug!(self.logger, "Memory pool torn down";
               "unreturned_bytes" => unreturned);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use trackable::result::TestResult;

    /// 常に枯渇しているバッキングヒープ.
    struct ExhaustedHeap;
    impl HeapMemory for ExhaustedHeap {
        fn allocate(&mut self, _size: usize) -> Option<NonNull<u8>> {
            None
        }
        unsafe fn release(&mut self, _ptr: NonNull<u8>) {
            unreachable!()
        }
    }

    /// 割当・解放の回数を数えるバッキングヒープ.
    #[derive(Clone)]
    struct CountingHeap {
        allocations: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }
    impl CountingHeap {
        fn new() -> Self {
            CountingHeap {
                allocations: Arc::new(AtomicUsize::new(0)),
                releases: Arc::new(AtomicUsize::new(0)),
            }
        }
    }
    impl HeapMemory for CountingHeap {
        fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
            self.allocations.fetch_add(1, Ordering::SeqCst);
            LibcHeap.allocate(size)
        }
        unsafe fn release(&mut self, ptr: NonNull<u8>) {
            self.releases.fetch_add(1, Ordering::SeqCst);
            LibcHeap.release(ptr);
        }
    }

    #[test]
    fn round_trip_works() -> TestResult {
        let pool = PoolBuilder::new().build();
        let sizes = [13, 64, 200, 7, 31, 256, 1];
        let mut ptrs = Vec::new();
        for &size in sizes.iter() {
            ptrs.push(track!(pool.allocate(size))?);
            pool.audit();
        }
        assert_eq!(pool.allocated_size(), sizes.iter().sum::<usize>());
        assert_eq!(pool.num_used_blocks(), sizes.len());

        // 貸出とは無関係な順序で全て返却する
        for &i in &[3, 0, 6, 2, 5, 1, 4] {
            assert!(pool.deallocate(ptrs[i].as_ptr()));
            pool.audit();
        }
        assert_eq!(pool.allocated_size(), 0);
        assert_eq!(pool.num_used_blocks(), 0);
        Ok(())
    }

    #[test]
    fn coalescing_works() -> TestResult {
        for order in &[[0, 1], [1, 0]] {
            let pool = PoolBuilder::new().min_bytes(256).build();
            let ptrs = [track!(pool.allocate(64))?, track!(pool.allocate(64))?];
            assert_eq!(pool.metrics().backing_allocations(), 1);

            for &i in order.iter() {
                assert!(pool.deallocate(ptrs[i].as_ptr()));
                pool.audit();
            }
            assert_eq!(pool.num_free_blocks(), 1);
            assert_eq!(pool.free_bytes(), 256);

            // バッキング割当全体が一つの空きブロックに戻っているので、
            // 256バイトの貸出が新規のヒープ呼び出しなしで行える
            let ptr = track!(pool.allocate(256))?;
            assert_eq!(pool.metrics().backing_allocations(), 1);
            assert!(pool.deallocate(ptr.as_ptr()));
        }
        Ok(())
    }

    #[test]
    fn double_free_is_reported() -> TestResult {
        let pool = PoolBuilder::new().build();
        let a = track!(pool.allocate(10))?;
        let b = track!(pool.allocate(10))?;

        assert!(pool.deallocate(a.as_ptr()));
        let allocated = pool.allocated_size();

        // 二度目の返却は失敗として報告され、状態は変化しない
        assert!(!pool.deallocate(a.as_ptr()));
        assert_eq!(pool.allocated_size(), allocated);
        pool.audit();

        assert!(pool.deallocate(b.as_ptr()));
        Ok(())
    }

    #[test]
    fn best_fit_reuses_smallest_sufficient_block() -> TestResult {
        let pool = PoolBuilder::new().min_bytes(1).build();

        // それぞれが独立したバッキング割当となる
        let p100 = track!(pool.allocate(100))?;
        let p50 = track!(pool.allocate(50))?;
        let p30 = track!(pool.allocate(30))?;
        assert!(pool.deallocate(p100.as_ptr()));
        assert!(pool.deallocate(p50.as_ptr()));
        assert!(pool.deallocate(p30.as_ptr()));
        assert_eq!(pool.num_free_blocks(), 3);

        // {100, 50, 30}のうち、40バイトの要求を満たす最小の50バイトブロックが選ばれる
        let p40 = track!(pool.allocate(40))?;
        assert_eq!(p40, p50);
        assert_eq!(pool.num_free_blocks(), 3); // {100, 30}と、50から残った10
        assert_eq!(pool.free_bytes(), 140);
        pool.audit();

        assert!(pool.deallocate(p40.as_ptr()));
        Ok(())
    }

    #[test]
    fn zero_fill_works() -> TestResult {
        let pool = PoolBuilder::new().min_bytes(256).build();

        let ptr = track!(pool.allocate(32))?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0xFF, 32) };
        assert!(pool.deallocate(ptr.as_ptr()));

        // 同じ範囲が再利用されても、返却時点の内容に関係なくゼロ初期化されている
        let ptr = track!(pool.allocate(32))?;
        for i in 0..32 {
            assert_eq!(unsafe { *ptr.as_ptr().add(i) }, 0);
        }
        assert!(pool.deallocate(ptr.as_ptr()));
        Ok(())
    }

    #[test]
    fn unknown_pointer_is_rejected() {
        let pool = PoolBuilder::new().build();
        let mut local = 0u8;
        assert!(!pool.deallocate(&mut local));
        assert!(!pool.deallocate(ptr::null_mut()));
        assert_eq!(pool.metrics().unknown_pointer_releases(), 2);
        pool.audit();
    }

    #[test]
    fn zero_size_is_normalized_to_one() -> TestResult {
        let pool = PoolBuilder::new().build();
        let ptr = track!(pool.allocate(0))?;
        assert_eq!(pool.allocated_size(), 1);
        assert!(pool.deallocate(ptr.as_ptr()));
        assert_eq!(pool.allocated_size(), 0);
        Ok(())
    }

    #[test]
    fn accounting_identity_holds() -> TestResult {
        let pool = PoolBuilder::new().min_bytes(512).build();
        let identity = |pool: &MemoryPool| {
            let overhead = pool.total_size() - pool.metrics().backing_allocated_bytes() as usize;
            assert_eq!(
                pool.allocated_size() + pool.free_bytes(),
                pool.total_size() - overhead
            );
        };

        identity(&pool);
        let a = track!(pool.allocate(100))?;
        identity(&pool);
        let b = track!(pool.allocate(600))?;
        identity(&pool);
        assert!(pool.deallocate(a.as_ptr()));
        identity(&pool);
        let c = track!(pool.allocate(50))?;
        identity(&pool);
        assert!(pool.deallocate(b.as_ptr()));
        assert!(pool.deallocate(c.as_ptr()));
        identity(&pool);
        Ok(())
    }

    #[test]
    fn heap_exhaustion_is_reported() {
        let pool = PoolBuilder::new().build_with(ExhaustedHeap);
        let e = pool.allocate(10).expect_err("must fail");
        assert_eq!(*e.kind(), ErrorKind::HeapExhausted);

        // 失敗後も状態は変化していない
        assert_eq!(pool.allocated_size(), 0);
        assert_eq!(pool.total_size(), 0);
        pool.audit();
    }

    #[test]
    fn teardown_returns_all_backing_allocations() -> TestResult {
        let heap = CountingHeap::new();
        let (allocations, releases) = (heap.allocations.clone(), heap.releases.clone());
        {
            let pool = PoolBuilder::new().min_bytes(64).build_with(heap);
            let a = track!(pool.allocate(64))?;
            let _b = track!(pool.allocate(64))?;
            let _c = track!(pool.allocate(200))?;
            assert!(pool.deallocate(a.as_ptr()));
            assert_eq!(allocations.load(Ordering::SeqCst), 3);
            assert_eq!(releases.load(Ordering::SeqCst), 0);

            // `_b`と`_c`は未返却のままプールを破棄する
        }
        assert_eq!(allocations.load(Ordering::SeqCst), 3);
        assert_eq!(releases.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[test]
    fn concurrent_allocations_work() {
        let pool = Arc::new(PoolBuilder::new().build());
        let mut handles = Vec::new();
        for t in 0..4usize {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                for i in 0..100usize {
                    let size = 1 + (t * 7 + i) % 64;
                    let ptr = pool.allocate(size).expect("allocation failed");
                    unsafe { ptr::write_bytes(ptr.as_ptr(), t as u8, size) };
                    assert!(pool.deallocate(ptr.as_ptr()));
                }
            }));
        }
        for handle in handles {
            handle.join().expect("thread panicked");
        }
        assert_eq!(pool.allocated_size(), 0);
        assert_eq!(pool.num_used_blocks(), 0);
        pool.audit();
    }

    #[test]
    fn global_pool_works() -> TestResult {
        let pool = MemoryPool::global();
        assert!(ptr::eq(pool, MemoryPool::global()));

        let p = track!(pool.allocate(16))?;
        assert!(pool.deallocate(p.as_ptr()));
        Ok(())
    }

    #[test]
    fn stat_queries_work() -> TestResult {
        let pool = PoolBuilder::new().min_bytes(256).build();
        assert_eq!(pool.total_size(), 0);

        let ptr = track!(pool.allocate(64))?;
        assert_eq!(pool.allocated_size(), 64);
        assert_eq!(pool.num_used_blocks(), 1);
        assert_eq!(pool.num_free_blocks(), 1);
        // ディスクリプタアリーナのオーバーヘッドが含まれる
        assert!(pool.total_size() > 256);

        assert!(pool.deallocate(ptr.as_ptr()));
        assert_eq!(pool.allocated_size(), 0);
        assert_eq!(pool.num_free_blocks(), 1);
        Ok(())
    }
}
