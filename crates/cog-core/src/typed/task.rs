//! Task trait - 型付き Task の定義
//!
//! ドキュメントの `name` と、`kwargs` をデコードする型を対応付けます。

use serde::de::DeserializeOwned;

/// Task は task 名と kwargs の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Deserialize)]
/// struct BuildTask {
///     sha: String,
///     #[serde(default = "default_build_command")]
///     build_command: String,
/// }
///
/// impl Task for BuildTask {
///     const NAME: &'static str = "build";
/// }
/// ```
///
/// # Trait Bounds
/// - `DeserializeOwned`: ドキュメントの kwargs から復元するため
/// - `Send + Sync`: 複数スレッドから安全に使えるため
/// - `'static`: spawn したタスクへ渡せるため（参照を持たない）
///
/// kwargs の省略値は serde の default で表現し、デコード後の値は不変の
/// 設定として `run` に渡されます。
pub trait Task: DeserializeOwned + Send + Sync + 'static {
    /// ドキュメントの `name` フィールドと一致する名前
    const NAME: &'static str;
}
