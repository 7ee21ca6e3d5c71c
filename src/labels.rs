//! タイルのラベル定義
//!
//! カテゴリ名とクラスIDの対応は固定で、マニフェストの読み込みと
//! ネットワークの出力次元の両方がこの一覧を参照します。

use crate::error::{Result, TileError};

/// クラス数
pub const NUM_CLASSES: usize = 12;

/// クラス名の定義（インデックスがクラスID）
pub const TILE_LABELS: [&str; NUM_CLASSES] = [
    "unknown", "mine", "flag", "0", "1", "2", "3", "4", "5", "6", "7", "8",
];

/// カテゴリ名 → クラスID の不変マップ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelMap {
    names: &'static [&'static str],
}

impl LabelMap {
    /// 標準のタイルラベル
    pub const fn standard() -> Self {
        Self { names: &TILE_LABELS }
    }

    pub fn id(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|label| *label == name)
            .ok_or_else(|| TileError::UnknownLabel(name.to_string()))
    }

    pub fn name(&self, id: usize) -> Option<&'static str> {
        self.names.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &'static [&'static str] {
        self.names
    }
}

impl Default for LabelMap {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_ordered() {
        let labels = LabelMap::standard();
        assert_eq!(labels.len(), NUM_CLASSES);
        for (id, name) in TILE_LABELS.iter().enumerate() {
            assert_eq!(labels.id(name).unwrap(), id);
            assert_eq!(labels.name(id), Some(*name));
        }
    }

    #[test]
    fn unknown_category_is_rejected() {
        let err = LabelMap::standard().id("nonexistent_label").unwrap_err();
        assert!(matches!(err, TileError::UnknownLabel(name) if name == "nonexistent_label"));
    }
}
