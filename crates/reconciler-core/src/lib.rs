//! reconciler-core
//!
//! Building blocks for key-based reconciliation controllers.
//!
//! # モジュール構成
//! - **domain**: 値としての型（Key, Outcome）
//! - **queue**: 重複排除・遅延・レート制限付きの WorkQueue と RateLimiter
//! - **source**: watch 通知 → キー投入のアダプタ、初期同期フラグ
//! - **reconciler**: 差し替え可能な Reconciler trait
//! - **worker**: 固定数のワーカープール
//! - **controller**: 初期同期待ち → ワーカー起動 → graceful shutdown
//! - **config** / **error** / **observability**: 設定・エラー・状態スナップショット

pub mod config;
pub mod controller;
pub mod domain;
pub mod error;
pub mod observability;
pub mod queue;
pub mod reconciler;
pub mod source;
pub mod worker;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerState};
pub use domain::{Key, Outcome};
pub use error::{ControllerError, ReconcileError};
pub use queue::{RateLimiter, WorkQueue};
pub use reconciler::{Reconciler, reconciler_fn};
