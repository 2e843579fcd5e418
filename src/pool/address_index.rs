//! 貸出中のデータポインタからブロックディスクリプタを引くためのインデックス.
use std::collections::BTreeMap;

use super::arena::BlockId;

/// 貸出中ポインタ群の位置情報を保持するインデックス.
///
/// 登録されているキー集合は、使用中チェーン上のディスクリプタの`data`ポインタ集合と常に一致する.
/// エントリはディスクリプタへの弱い関連付けであり、挿入・削除がディスクリプタの寿命に影響することはない.
#[derive(Debug, Default)]
pub(crate) struct AddressIndex {
    // `BTreeMap`の方が`HashMap`よりもメモリ効率が良いので、こちらを採用
    map: BTreeMap<usize, BlockId>,
}
impl AddressIndex {
    /// 新しい`AddressIndex`インスタンスを生成する.
    pub fn new() -> Self {
        AddressIndex {
            map: BTreeMap::new(),
        }
    }

    /// 貸出ポインタを登録する.
    pub fn insert(&mut self, ptr: *mut u8, id: BlockId) {
        let old = self.map.insert(ptr as usize, id);
        debug_assert!(old.is_none());
    }

    /// 指定されたポインタの登録を解除し、対応するディスクリプタの識別子を返す.
    pub fn remove(&mut self, ptr: *mut u8) -> Option<BlockId> {
        self.map.remove(&(ptr as usize))
    }

    /// インデックスのサイズ(i.e., 貸出中の範囲の数)を返す.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.map.len()
    }
}
