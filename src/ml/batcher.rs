//! バッチ作成とデータ読み込み

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Int, Tensor},
};
use rand::{rngs::StdRng, seq::SliceRandom};
use rayon::prelude::*;

use crate::error::Result;
use crate::ml::dataset::{TileSample, TileSubset};

/// バッチデータ
#[derive(Clone, Debug)]
pub struct TileBatch<B: Backend> {
    /// [batch_size, 1, size, size]
    pub images: Tensor<B, 4>,
    /// [batch_size]
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
#[derive(Clone)]
pub struct TileBatcher<B: Backend> {
    device: B::Device,
}

impl<B: Backend> TileBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }
}

impl<B: Backend> Batcher<B, TileSample, TileBatch<B>> for TileBatcher<B> {
    fn batch(&self, items: Vec<TileSample>, _device: &B::Device) -> TileBatch<B> {
        let batch_size = items.len();
        let tile_size = items.first().map(|item| item.size).unwrap_or_default();
        let mut all_pixels = Vec::with_capacity(batch_size * tile_size * tile_size);
        let mut targets_vec = Vec::with_capacity(batch_size);

        for item in items {
            all_pixels.extend_from_slice(&item.pixels);
            targets_vec.push(item.label as i64);
        }

        // 1回の転送でバッチ全体をデバイスへ
        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 1, tile_size, tile_size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        TileBatch { images, targets }
    }
}

/// サブセットからバッチを順に読み込むローダー
///
/// 1バッチ分のサンプルは rayon で並列に読み込みます。読み込みに
/// 失敗した時点でそのバッチはエラーになります。
pub struct BatchLoader<B: Backend> {
    subset: TileSubset,
    batcher: TileBatcher<B>,
    batch_size: usize,
}

impl<B: Backend> BatchLoader<B> {
    pub fn new(subset: TileSubset, batcher: TileBatcher<B>, batch_size: usize) -> Self {
        Self {
            subset,
            batcher,
            batch_size: batch_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.subset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subset.is_empty()
    }

    /// バッチ数
    pub fn num_batches(&self) -> usize {
        self.subset.len().div_ceil(self.batch_size)
    }

    /// 1エポック分のバッチ（サブセット内の位置）
    ///
    /// `shuffle` が与えられた場合は順序をシャッフルし、なければ固定順です。
    pub fn epoch_plan(&self, shuffle: Option<&mut StdRng>) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.subset.len()).collect();
        if let Some(rng) = shuffle {
            order.shuffle(rng);
        }
        order.chunks(self.batch_size).map(<[usize]>::to_vec).collect()
    }

    /// 指定位置のサンプルを読み込んでバッチにする
    pub fn load(&self, positions: &[usize]) -> Result<TileBatch<B>> {
        let samples = positions
            .par_iter()
            .map(|&position| self.subset.get(position))
            .collect::<Result<Vec<_>>>()?;

        Ok(self.batcher.batch(samples, self.batcher.device()))
    }
}
