//! Dynamic-size Memory Pool.
//!
//! `dynapool`は、割当頻度の高い性能重視のコード(e.g., シミュレーションループ内の毎フレーム割当)向けに、
//! バッキングヒープへの呼び出し回数を最小化することを目的とした可変長サブアロケータ.
//!
//! # 特徴
//!
//! - 呼び出し元が要求したバイト範囲を、少数の粗粒度なバッキング割当から切り出して貸し出す
//! - 貸出中・空きの各領域は、アドレス昇順のブロックチェーンとして管理される
//! - 割当戦略は"BestFit"(要求サイズを満たす空きブロックのうち最小のものを選択)
//! - 解放時には、アドレス隣接する空きブロック同士が自動的に併合(coalescing)される
//!   - ただし、異なるバッキング割当由来のブロック同士が併合されることはない
//! - 解放は、貸出ポインタからブロックを直接引けるインデックスにより、チェーン走査なしで行える
//! - 返却される範囲は常にゼロ初期化されている
//!
//! # モジュールの依存関係
//!
//! ```text
//! pool => heap
//! ```
//!
//! - [pool]モジュール:
//!   - 主に[MemoryPool]構造体を提供
//!   - `dynapool`の利用者が直接触るのはこの構造体
//!   - ブロックチェーンの管理(探索・分割・併合)と、その排他制御を担当する
//! - [heap]モジュール:
//!   - 主に[HeapMemory]トレイトとその実装である[LibcHeap]を提供
//!   - [pool]に対して粗粒度の生メモリを供給するのが目的
//!
//! # 注意
//!
//! このクレートはシステムアロケータの汎用的な代替品ではない.
//! 貸し出された全ての範囲は、利用者が明示的に返却する必要がある
//! (ガーベジコレクションは行われない).
//!
//! [pool]: ./pool/index.html
//! [MemoryPool]: ./pool/struct.MemoryPool.html
//! [heap]: ./heap/index.html
//! [HeapMemory]: ./heap/trait.HeapMemory.html
//! [LibcHeap]: ./heap/struct.LibcHeap.html
#![warn(missing_docs)]
extern crate libc;
extern crate prometrics;
#[macro_use]
extern crate slog;
#[macro_use]
extern crate trackable;

pub use crate::error::{Error, ErrorKind};
pub use crate::pool::{MemoryPool, PoolBuilder};

pub mod heap;
pub mod metrics;
pub mod pool;

mod error;

/// crate固有の`Result`型.
pub type Result<T> = std::result::Result<T, Error>;
