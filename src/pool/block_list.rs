//! フリー/使用中ブロックチェーンの管理.
//!
//! プールが保持する全てのブロックディスクリプタは、
//! アドレス昇順にソートされた二本の双方向チェーン(フリー・使用中)のどちらか一方に属する.
//! ソート順が常に保たれているため、併合可能性の判定は挿入位置さえ分かれば定数時間で行える.
//!
//! # 割当戦略
//!
//! このモジュールは"BestFit"戦略を採用している.
//!
//! 新規割当要求が発行された際には、フリーチェーンを一度だけ走査し、
//! 要求サイズを満たす空きブロックの中で、一番サイズが小さいものが選択される
//! (同サイズの候補が複数ある場合には、アドレスの小さい方が選ばれる).
//!
//! 選択されたブロックに余剰がある場合には分割が行われ、
//! 残余分は新しい非ヘッドブロックとしてフリーチェーンに残される.
use std::cmp;
use std::ptr::NonNull;

use super::arena::{Block, BlockArena, BlockId};
use crate::heap::HeapMemory;
use crate::metrics::PoolMetrics;
use crate::{ErrorKind, Result};

/// ディスクリプタの所属先チェーンの識別子.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Chain {
    Free,
    Used,
}

/// ブロックチェーンの管理者.
///
/// バッキングヒープ自体は所有せず、成長・破棄の際に引数として受け取る.
#[derive(Debug)]
pub(crate) struct BlockList {
    arena: BlockArena,
    free_head: Option<BlockId>,
    used_head: Option<BlockId>,
    total_bytes: usize,
    min_bytes: usize,
    metrics: PoolMetrics,
}
impl BlockList {
    pub fn new(min_bytes: usize, metrics: PoolMetrics) -> Self {
        BlockList {
            arena: BlockArena::new(),
            free_head: None,
            used_head: None,
            total_bytes: 0,
            min_bytes,
            metrics,
        }
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// バッキングヒープから確保済みのバイト数の合計.
    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    /// ディスクリプタアリーナ自身が占有しているバイト数.
    pub fn reserved_bytes(&self) -> usize {
        self.arena.reserved_bytes()
    }

    pub fn block_data(&self, id: BlockId) -> NonNull<u8> {
        self.arena.get(id).data
    }

    pub fn block_size(&self, id: BlockId) -> usize {
        self.arena.get(id).size
    }

    /// `size`バイト以上の空きブロックのうち、最小のものを返す(BestFit).
    ///
    /// フリーチェーンの走査は一度だけ行われ、
    /// 同サイズの候補同士ではアドレス昇順で先に現れたものが勝つ.
    pub fn find_usable_block(&self, size: usize) -> Option<BlockId> {
        let mut best: Option<BlockId> = None;
        let mut cursor = self.free_head;
        while let Some(id) = cursor {
            let block = self.arena.get(id);
            if block.size >= size && best.map_or(true, |b| block.size < self.arena.get(b).size) {
                best = Some(id);
            }
            cursor = block.next;
        }
        best
    }

    /// バッキングヒープから新しい領域を確保し、ヘッドブロックとしてフリーチェーンに加える.
    ///
    /// 実際の要求量は`max(size, min_bytes)`となる.
    /// `min_bytes`が、バッキングヒープ呼び出しの償却度合いを制御する唯一のつまみである.
    ///
    /// # Errors
    ///
    /// - バッキングヒープが領域を供給できない場合: `ErrorKind::HeapExhausted`
    /// - ディスクリプタ用スロットを確保できない場合: `ErrorKind::DescriptorExhausted`
    ///
    /// どちらの場合も、プールの状態は変更されない.
    pub fn allocate_block<H: HeapMemory>(&mut self, heap: &mut H, size: usize) -> Result<BlockId> {
        let size_to_alloc = cmp::max(size, self.min_bytes);
        let data = track_assert_some!(heap.allocate(size_to_alloc), ErrorKind::HeapExhausted);
        let block = Block {
            data,
            size: size_to_alloc,
            is_head: true,
            prev: None,
            next: None,
        };
        let id = match self.arena.insert(block) {
            Some(id) => id,
            None => {
                // ディスクリプタなしでは管理できないので、確保した領域は返してしまう
                unsafe { heap.release(data) };
                track_panic!(ErrorKind::DescriptorExhausted);
            }
        };
        self.total_bytes += size_to_alloc;
        self.metrics.backing_allocations.increment();
        self.metrics.backing_allocated_bytes.add_u64(size_to_alloc as u64);
        self.insert_sorted(Chain::Free, id);
        Ok(id)
    }

    /// フリーチェーン上のブロック`id`から先頭`size`バイトを切り出し、チェーンから外す.
    ///
    /// `id`のサイズが`size`と一致する場合には、分割なしでそのまま外される.
    /// 余剰がある場合には、残余分が新しい非ヘッドブロックとして`id`の位置に残される
    /// (アドレス的に直後なので、並べ替えは不要).
    ///
    /// # 事前条件
    ///
    /// - `id`はフリーチェーン上にあり、`size`以上のサイズを持つ
    ///
    /// # Errors
    ///
    /// 残余分用のディスクリプタを確保できない場合には`ErrorKind::DescriptorExhausted`が
    /// 返され、チェーンは変更されない.
    pub fn split_block(&mut self, id: BlockId, size: usize) -> Result<()> {
        let (data, old_size, next) = {
            let block = self.arena.get(id);
            debug_assert!(block.size >= size);
            (block.data, block.size, block.next)
        };
        if old_size > size {
            let rest = Block {
                data: unsafe { NonNull::new_unchecked(data.as_ptr().add(size)) },
                size: old_size - size,
                is_head: false,
                prev: None,
                next: None,
            };
            let rest_id = track_assert_some!(self.arena.insert(rest), ErrorKind::DescriptorExhausted);
            self.arena.get_mut(id).size = size;
            self.link_between(Chain::Free, rest_id, Some(id), next);
        }
        self.unlink(Chain::Free, id);
        Ok(())
    }

    /// チェーンに属していないブロックを、使用中チェーンのアドレス順の位置に挿入する.
    pub fn push_used(&mut self, id: BlockId) {
        self.insert_sorted(Chain::Used, id);
    }

    /// 使用中のブロックをフリーチェーンへ戻し、アドレス隣接する空きブロックと併合する.
    ///
    /// 併合は前方(下位アドレス)・後方(上位アドレス)それぞれについて試みられ、
    /// 成立した分だけディスクリプタがアリーナに返却される(0〜2個).
    /// ヘッドブロックが前方の隣接ブロックへ吸収されること、および、
    /// 後続のヘッドブロックを吸収することは、バッキング割当の境界を壊すため行われない.
    ///
    /// 返り値は成立した併合の数.
    pub fn release_block(&mut self, id: BlockId) -> usize {
        self.unlink(Chain::Used, id);
        self.insert_sorted(Chain::Free, id);

        let mut merges = 0;
        let mut cur = id;

        let (is_head, prev) = {
            let block = self.arena.get(cur);
            (block.is_head, block.prev)
        };
        if !is_head {
            if let Some(prev_id) = prev {
                if self.arena.get(prev_id).end() == self.arena.get(cur).start() {
                    self.unlink(Chain::Free, cur);
                    let removed = self.arena.remove(cur);
                    self.arena.get_mut(prev_id).size += removed.size;
                    self.metrics.merged_blocks.increment();
                    merges += 1;
                    cur = prev_id;
                }
            }
        }

        if let Some(next_id) = self.arena.get(cur).next {
            let mergeable = {
                let next = self.arena.get(next_id);
                !next.is_head && self.arena.get(cur).end() == next.start()
            };
            if mergeable {
                self.unlink(Chain::Free, next_id);
                let removed = self.arena.remove(next_id);
                self.arena.get_mut(cur).size += removed.size;
                self.metrics.merged_blocks.increment();
                merges += 1;
            }
        }

        merges
    }

    /// 全てのブロックを解放し、バッキング割当をヒープへ返す.
    ///
    /// 使用中のブロックを全て解放した後には、
    /// 同一バッキング割当由来のブロック群は併合によりヘッドブロック一つに戻っているはずであり、
    /// フリーチェーンにはヘッドブロックのみが残る.
    pub fn release_all<H: HeapMemory>(&mut self, heap: &mut H) {
        while let Some(id) = self.used_head {
            self.release_block(id);
        }
        while let Some(id) = self.free_head {
            self.unlink(Chain::Free, id);
            let block = self.arena.remove(id);
            debug_assert!(block.is_head);
            self.total_bytes -= block.size;
            unsafe { heap.release(block.data) };
        }
    }

    /// 指定チェーンの長さを返す.
    pub fn chain_len(&self, chain: Chain) -> usize {
        let mut n = 0;
        let mut cursor = self.head(chain);
        while let Some(id) = cursor {
            n += 1;
            cursor = self.arena.get(id).next;
        }
        n
    }

    /// フリーチェーン上のブロックサイズの合計(テスト用).
    #[cfg(test)]
    pub fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut cursor = self.free_head;
        while let Some(id) = cursor {
            let block = self.arena.get(id);
            total += block.size;
            cursor = block.next;
        }
        total
    }

    fn head(&self, chain: Chain) -> Option<BlockId> {
        match chain {
            Chain::Free => self.free_head,
            Chain::Used => self.used_head,
        }
    }

    fn set_head(&mut self, chain: Chain, id: Option<BlockId>) {
        match chain {
            Chain::Free => self.free_head = id,
            Chain::Used => self.used_head = id,
        }
    }

    /// チェーンに属していないブロックを、アドレス順を保つ位置に挿入する.
    fn insert_sorted(&mut self, chain: Chain, id: BlockId) {
        let start = self.arena.get(id).start();
        let mut prev = None;
        let mut cursor = self.head(chain);
        while let Some(c) = cursor {
            let block = self.arena.get(c);
            if block.start() > start {
                break;
            }
            prev = Some(c);
            cursor = block.next;
        }
        self.link_between(chain, id, prev, cursor);
    }

    fn link_between(
        &mut self,
        chain: Chain,
        id: BlockId,
        prev: Option<BlockId>,
        next: Option<BlockId>,
    ) {
        {
            let block = self.arena.get_mut(id);
            block.prev = prev;
            block.next = next;
        }
        match prev {
            Some(p) => self.arena.get_mut(p).next = Some(id),
            None => self.set_head(chain, Some(id)),
        }
        if let Some(n) = next {
            self.arena.get_mut(n).prev = Some(id);
        }
        if chain == Chain::Free {
            self.metrics.inserted_free_blocks.increment();
        }
    }

    fn unlink(&mut self, chain: Chain, id: BlockId) {
        let (prev, next) = {
            let block = self.arena.get(id);
            (block.prev, block.next)
        };
        match prev {
            Some(p) => self.arena.get_mut(p).next = next,
            None => self.set_head(chain, next),
        }
        if let Some(n) = next {
            self.arena.get_mut(n).prev = prev;
        }
        {
            let block = self.arena.get_mut(id);
            block.prev = None;
            block.next = None;
        }
        if chain == Chain::Free {
            self.metrics.removed_free_blocks.increment();
        }
    }

    /// チェーン不変条件の機械的検査(テスト用).
    ///
    /// - 両チェーンのアドレスが狭義単調増加であること
    /// - `prev`リンクが`next`リンクと対称であること
    /// - アリーナ中のディスクリプタが全てどちらかのチェーンに属していること
    #[cfg(test)]
    pub fn audit(&self) {
        let mut counted = 0;
        for &chain in &[Chain::Free, Chain::Used] {
            let mut prev: Option<BlockId> = None;
            let mut last_start = None;
            let mut cursor = self.head(chain);
            while let Some(id) = cursor {
                let block = self.arena.get(id);
                assert_eq!(block.prev, prev, "broken prev link in {:?} chain", chain);
                if let Some(last) = last_start {
                    assert!(last < block.start(), "unsorted {:?} chain", chain);
                }
                last_start = Some(block.start());
                prev = Some(id);
                cursor = block.next;
                counted += 1;
            }
        }
        assert_eq!(counted, self.arena.len());
    }
}
