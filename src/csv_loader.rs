use crate::error::{Result, TileError};
use crate::labels::LabelMap;
use csv::{ReaderBuilder, Trim};
use std::path::{Path, PathBuf};

/// マニフェストのファイル名
pub const MANIFEST_FILE: &str = "images.csv";

/// マニフェスト1行分（画像の相対パスとクラスID）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileRecord {
    pub path: PathBuf,
    pub class_id: usize,
}

/// `images.csv` を読み込む
///
/// 1行目はヘッダーとして読み飛ばします。各行の先頭2列を
/// (画像パス, カテゴリ名) として扱い、3列目以降は無視します。
pub fn load_manifest(path: &Path, labels: &LabelMap) -> Result<Vec<TileRecord>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)?;

    let mut records = Vec::new();

    for result in reader.records() {
        let record = result?;

        let (Some(image_path), Some(category)) = (record.get(0), record.get(1)) else {
            return Err(TileError::ManifestFormat {
                path: path.to_path_buf(),
                line: record.position().map(|p| p.line()).unwrap_or_default(),
            });
        };

        records.push(TileRecord {
            path: PathBuf::from(image_path),
            class_id: labels.id(category)?,
        });
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(name: &str, body: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tile_manifest_{}_{}", name, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(MANIFEST_FILE);
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn parses_rows_in_order_and_trims_fields() {
        let path = write_manifest("ok", "path,category\n a.png , mine\nb.png,8\nc.png,unknown,extra\n");
        let records = load_manifest(&path, &LabelMap::standard()).unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0], TileRecord { path: PathBuf::from("a.png"), class_id: 1 });
        assert_eq!(records[1].class_id, 11);
        assert_eq!(records[2].class_id, 0);
    }

    #[test]
    fn single_field_row_is_a_format_error() {
        let path = write_manifest("short", "path,category\ntile1.png\n");
        let err = load_manifest(&path, &LabelMap::standard()).unwrap_err();
        assert!(matches!(err, TileError::ManifestFormat { line: 2, .. }), "{err:?}");
    }

    #[test]
    fn unknown_category_is_rejected() {
        let path = write_manifest("label", "path,category\ntile2.png, nonexistent_label\n");
        let err = load_manifest(&path, &LabelMap::standard()).unwrap_err();
        assert!(matches!(err, TileError::UnknownLabel(ref name) if name == "nonexistent_label"));
    }
}
