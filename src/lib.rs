//! 青果の鮮度分類
//!
//! 画像ディレクトリからCNNを学習し、保存したモデルで画像1枚ごとに
//! ラベル・確信度・鮮度フラグを返します。

pub mod api;
pub mod backend;
pub mod error;
pub mod history;
pub mod logging;
pub mod ml;
pub mod model;

pub use error::{ErrorKind, FreshError, Result};
