//! バッキングヒープのインターフェース定義と実装群.
//!
//! このモジュールは[MemoryPool](../pool/struct.MemoryPool.html)がブロックの切り出しに使用する
//! 粗粒度の生メモリ領域を提供する.
use std::ptr::NonNull;

/// 粗粒度の生メモリ供給源を表すトレイト.
///
/// プールは、空きブロックが不足した際にのみこのトレイト経由でメモリを要求し、
/// 確保した領域はプール自身の破棄時まで保持し続ける.
/// そのため、実装側で割当呼び出し毎のコストを細かく最適化する必要はない.
///
/// 確保された領域の内容は未定義で構わない(ゼロ初期化はプール側の責務).
pub trait HeapMemory {
    /// `size`バイトの連続領域を確保する.
    ///
    /// 供給できない場合には`None`が返される.
    /// `size`が`0`で呼び出されることはない.
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// `allocate`が返した領域を解放する.
    ///
    /// # Safety
    ///
    /// `ptr`は、このインスタンスの`allocate`が返したポインタであり、
    /// かつ、未だ解放されていないものである必要がある.
    unsafe fn release(&mut self, ptr: NonNull<u8>);
}

/// `libc::malloc`/`libc::free`ベースの`HeapMemory`実装.
///
/// デフォルトのバッキングヒープとして使用される.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHeap;
impl HeapMemory for LibcHeap {
    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { libc::malloc(size) } as *mut u8)
    }
    unsafe fn release(&mut self, ptr: NonNull<u8>) {
        libc::free(ptr.as_ptr() as *mut libc::c_void);
    }
}
