//! タイル画像データセット
//!
//! `images.csv` を読み込んでレコード一覧を保持し、画像は取得時に
//! 読み込んで前処理します。学習/検証への分割はインデックスのみで行い、
//! レコード自体は複製しません。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::csv_loader::{load_manifest, TileRecord, MANIFEST_FILE};
use crate::error::{Result, TileError};
use crate::labels::LabelMap;
use crate::ml::transform::{composite_on_black, TilePipeline};

/// 前処理済みのタイル1枚（[1, size, size] を平坦化）とクラスID
#[derive(Clone, Debug, PartialEq)]
pub struct TileSample {
    pub pixels: Vec<f32>,
    pub size: usize,
    pub label: usize,
}

impl TileSample {
    pub fn shape(&self) -> [usize; 3] {
        [1, self.size, self.size]
    }
}

/// 学習データセット
pub struct TileDataset {
    root: PathBuf,
    records: Vec<TileRecord>,
    pipeline: TilePipeline,
    labels: LabelMap,
}

impl TileDataset {
    /// ディレクトリ内の `images.csv` からデータセットを構築
    pub fn from_directory(data_dir: &Path, pipeline: TilePipeline) -> Result<Self> {
        Self::from_directory_with_labels(data_dir, pipeline, LabelMap::standard())
    }

    pub fn from_directory_with_labels(
        data_dir: &Path,
        pipeline: TilePipeline,
        labels: LabelMap,
    ) -> Result<Self> {
        let records = load_manifest(&data_dir.join(MANIFEST_FILE), &labels)?;
        log::debug!("{} から {} 件のタイルを読み込みました", data_dir.display(), records.len());

        Ok(Self {
            root: data_dir.to_path_buf(),
            records,
            pipeline,
            labels,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TileRecord] {
        &self.records
    }

    pub fn labels(&self) -> &LabelMap {
        &self.labels
    }

    /// 拡張の乱数を次のエポックに進める
    pub fn advance_epoch(&self) {
        self.pipeline.advance_epoch();
    }

    /// 画像を読み込み、透過部分を黒で合成してから前処理を適用
    pub fn get(&self, index: usize) -> Result<TileSample> {
        let record = self.records.get(index).ok_or(TileError::IndexOutOfRange {
            index,
            len: self.records.len(),
        })?;

        let path = self.root.join(&record.path);
        let image = image::open(&path)
            .map_err(|source| TileError::ImageDecode { path, source })?
            .to_rgba8();
        let composited = composite_on_black(&image);

        Ok(TileSample {
            pixels: self.pipeline.apply(&composited, index),
            size: self.pipeline.size(),
            label: record.class_id,
        })
    }

    /// データセットを学習用と検証用に分割（インデックスのみ）
    ///
    /// シャッフル後、先頭 `floor(len * train_ratio)` 件を学習用とします。
    pub fn split(self: Arc<Self>, train_ratio: f32, seed: Option<u64>) -> (TileSubset, TileSubset) {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        indices.shuffle(&mut rng);

        let train_len = ((self.len() as f32 * train_ratio) as usize).min(self.len());
        let val_indices = indices.split_off(train_len);

        (
            TileSubset { dataset: Arc::clone(&self), indices },
            TileSubset { dataset: self, indices: val_indices },
        )
    }
}

/// データセットの一部（インデックスの集合）
#[derive(Clone)]
pub struct TileSubset {
    dataset: Arc<TileDataset>,
    indices: Vec<usize>,
}

impl TileSubset {
    /// データセット全体を表すサブセット
    pub fn full(dataset: Arc<TileDataset>) -> Self {
        let indices = (0..dataset.len()).collect();
        Self { dataset, indices }
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn get(&self, index: usize) -> Result<TileSample> {
        let source = *self.indices.get(index).ok_or(TileError::IndexOutOfRange {
            index,
            len: self.indices.len(),
        })?;
        self.dataset.get(source)
    }
}
