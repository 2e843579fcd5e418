use std;
use trackable;
use trackable::error::ErrorKindExt;

/// crate固有のエラー型.
#[derive(Debug, Clone, TrackableError)]
pub struct Error(trackable::error::TrackableError<ErrorKind>);
impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        ErrorKind::Other.cause(e.to_string()).into()
    }
}

/// 発生し得るエラーの種別.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// バッキングヒープが要求されたバイト数を供給できなかった.
    ///
    /// # 典型的な対応策
    ///
    /// - 貸出中の範囲を返却してから再試行する
    /// - プールの`min_bytes`を小さくして、一度のバッキング割当量を減らす
    HeapExhausted,

    /// ブロックディスクリプタ用のスロットを確保できなかった.
    ///
    /// ディスクリプタアリーナのインデックス幅の上限に到達した場合に返される.
    ///
    /// # 典型的な対応策
    ///
    /// - 貸出中の範囲を返却して、ディスクリプタを再利用可能にする
    DescriptorExhausted,

    /// 入力が不正.
    ///
    /// # 典型的な対応策
    ///
    /// - 利用者側のプログラムを修正して入力を正しくする
    InvalidInput,

    /// 内部状態が不整合に陥っている.
    ///
    /// プログラムにバグがあることを示している.
    ///
    /// # 典型的な対応策
    ///
    /// - バグ修正を行ってプログラムを更新する
    InconsistentState,

    /// その他エラー.
    ///
    /// E.g., ロックのポイズニング
    Other,
}
impl trackable::error::ErrorKind for ErrorKind {}
