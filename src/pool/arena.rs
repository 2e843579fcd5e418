//! ブロックディスクリプタ用のスロットアリーナ.
//!
//! ディスクリプタ群は`Vec`ベースのアリーナに格納され、安定したインデックス([`BlockId`])で参照される.
//! チェーンのリンクも生ポインタではなくインデックスで表現されるため、
//! リンク操作の誤りはダングリングポインタではなく、機械的に検査可能な範囲外インデックスとして現れる.
use std::mem;
use std::ptr::NonNull;

/// アリーナの成長単位(スロット数).
const GROW_CHUNK: usize = 64;

/// ブロックディスクリプタの安定した識別子.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct BlockId(u32);
impl BlockId {
    fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// 一つの連続したバイト範囲とそのチェーン上の位置を記述するディスクリプタ.
///
/// `data`が指す範囲の所有者は、切り出し元のバッキング割当であり、ディスクリプタ自身ではない.
/// ディスクリプタは常に{フリーチェーン, 使用中チェーン}のどちらか一方だけに属する.
#[derive(Debug)]
pub(crate) struct Block {
    pub data: NonNull<u8>,
    pub size: usize,
    /// 自身のバッキング割当から最初に切り出されたブロックか否か.
    ///
    /// バッキング割当毎にちょうど一つのディスクリプタで`true`となり、以後クリアされることはない.
    /// 併合がこの境界を跨ぐと、破棄時にバッキングヒープへ返す割当単位が壊れる.
    pub is_head: bool,
    pub prev: Option<BlockId>,
    pub next: Option<BlockId>,
}
impl Block {
    /// 範囲の開始アドレス.
    pub fn start(&self) -> usize {
        self.data.as_ptr() as usize
    }

    /// 範囲の終端アドレス(exclusive).
    pub fn end(&self) -> usize {
        self.start() + self.size
    }
}

#[derive(Debug)]
enum Slot {
    Occupied(Block),
    Vacant(Option<BlockId>),
}

/// ディスクリプタ群を保持する固定サイズスロットのアリーナ.
///
/// スロットの再利用は空きスロットリストにより行われ、
/// 容量は`GROW_CHUNK`スロット単位で拡張される(成長ポリシーはアリーナ自身の責務).
#[derive(Debug)]
pub(crate) struct BlockArena {
    slots: Vec<Slot>,
    vacant_head: Option<BlockId>,
}
impl BlockArena {
    /// 空のアリーナを生成する.
    pub fn new() -> Self {
        BlockArena {
            slots: Vec::new(),
            vacant_head: None,
        }
    }

    /// `block`を空きスロットに格納し、その識別子を返す.
    ///
    /// インデックス幅(`u32`)の上限に達してスロットを確保できない場合には`None`が返される.
    pub fn insert(&mut self, block: Block) -> Option<BlockId> {
        if self.vacant_head.is_none() {
            self.grow()?;
        }
        let id = self.vacant_head.take().expect("Never fails");
        match mem::replace(&mut self.slots[id.as_usize()], Slot::Occupied(block)) {
            Slot::Vacant(next) => self.vacant_head = next,
            Slot::Occupied(_) => unreachable!(),
        }
        Some(id)
    }

    /// `id`のスロットを空け、格納されていたディスクリプタを返す.
    pub fn remove(&mut self, id: BlockId) -> Block {
        let slot = mem::replace(
            &mut self.slots[id.as_usize()],
            Slot::Vacant(self.vacant_head),
        );
        match slot {
            Slot::Occupied(block) => {
                self.vacant_head = Some(id);
                block
            }
            Slot::Vacant(_) => unreachable!(),
        }
    }

    pub fn get(&self, id: BlockId) -> &Block {
        match &self.slots[id.as_usize()] {
            Slot::Occupied(block) => block,
            Slot::Vacant(_) => unreachable!(),
        }
    }

    pub fn get_mut(&mut self, id: BlockId) -> &mut Block {
        match &mut self.slots[id.as_usize()] {
            Slot::Occupied(block) => block,
            Slot::Vacant(_) => unreachable!(),
        }
    }

    /// 格納中のディスクリプタ数(テスト用).
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| match slot {
                Slot::Occupied(_) => true,
                Slot::Vacant(_) => false,
            })
            .count()
    }

    /// アリーナ自身が占有しているバイト数.
    pub fn reserved_bytes(&self) -> usize {
        self.slots.capacity() * mem::size_of::<Slot>()
    }

    fn grow(&mut self) -> Option<()> {
        let start = self.slots.len();
        if start >= u32::max_value() as usize {
            return None;
        }
        let end = std::cmp::min(start + GROW_CHUNK, u32::max_value() as usize);
        self.slots.reserve(end - start);
        for i in start..end {
            // 新しいスロット同士を逆順に数珠繋ぎにする
            let next = if i == start {
                None
            } else {
                Some(BlockId(i as u32 - 1))
            };
            self.slots.push(Slot::Vacant(next));
        }
        self.vacant_head = Some(BlockId(end as u32 - 1));
        Some(())
    }
}
