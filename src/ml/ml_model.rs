//! タイル分類用CNNモデル
//!
//! 畳み込みブロックは [`FEATURE_BLOCKS`] の記述子テーブルから順に構築します。
//! チェックポイントとONNX出力はこの構造に依存するため、変更すると
//! 既存のチェックポイントは読み込めなくなります。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};

use crate::error::TileError;
use crate::labels::NUM_CLASSES;

/// 入力画像サイズ（正方形）
pub const IMAGE_SIZE: usize = 32;

/// 畳み込みブロックの記述子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvBlockSpec {
    pub channels: [usize; 2],
    pub pool: bool,
}

/// Conv(3x3, pad 1) → BatchNorm → ReLU [→ MaxPool(2x2)]
pub const FEATURE_BLOCKS: [ConvBlockSpec; 4] = [
    ConvBlockSpec { channels: [1, 16], pool: false },  // [1,32,32] -> [16,32,32]
    ConvBlockSpec { channels: [16, 32], pool: true },  // -> [32,16,16]
    ConvBlockSpec { channels: [32, 64], pool: true },  // -> [64,8,8]
    ConvBlockSpec { channels: [64, 128], pool: true }, // -> [128,4,4]
];

/// 畳み込みの出力チャネル数 × 空間サイズ
pub const fn flattened_features() -> usize {
    let mut size = IMAGE_SIZE;
    let mut i = 0;
    while i < FEATURE_BLOCKS.len() {
        if FEATURE_BLOCKS[i].pool {
            size /= 2;
        }
        i += 1;
    }
    FEATURE_BLOCKS[FEATURE_BLOCKS.len() - 1].channels[1] * size * size
}

/// 全結合の中間次元
pub const HIDDEN_FEATURES: usize = 128;

/// モデル設定
#[derive(Config, Debug)]
pub struct ModelConfig {
    /// 分類クラス数
    #[config(default = "NUM_CLASSES")]
    pub num_classes: usize,
    /// ドロップアウト率
    #[config(default = 0.125)]
    pub dropout: f64,
}

impl ModelConfig {
    /// モデルを初期化
    pub fn init<B: Backend>(&self, device: &B::Device) -> TileClassifier<B> {
        let features = FEATURE_BLOCKS
            .iter()
            .map(|spec| ConvBlock {
                conv: Conv2dConfig::new(spec.channels, [3, 3])
                    .with_padding(PaddingConfig2d::Explicit(1, 1))
                    .init(device),
                norm: BatchNormConfig::new(spec.channels[1]).init(device),
                pool: spec.pool.then(|| {
                    MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init()
                }),
                activation: Relu::new(),
            })
            .collect();

        TileClassifier {
            features,
            dropout: DropoutConfig::new(self.dropout).init(),
            fc1: LinearConfig::new(flattened_features(), HIDDEN_FEATURES).init(device),
            fc2: LinearConfig::new(HIDDEN_FEATURES, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// Conv → BatchNorm → ReLU → (MaxPool)
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: BatchNorm<B>,
    pub pool: Option<MaxPool2d>,
    pub activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        let x = self.activation.forward(x);
        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }
}

/// タイル分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 (padding 1) + BatchNorm + ReLU (+ MaxPool 2x2)} x 4層
/// - Flatten (128 * 4 * 4 = 2048)
/// - Dropout(0.125)
/// - FC: 2048 -> 128 + ReLU
/// - FC: 128 -> num_classes
#[derive(Module, Debug)]
pub struct TileClassifier<B: Backend> {
    pub features: Vec<ConvBlock<B>>,
    pub dropout: Dropout,
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    pub activation: Relu,
}

impl<B: Backend> TileClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 1, 32, 32]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self
            .features
            .iter()
            .fold(images, |x, block| block.forward(x));

        let x: Tensor<B, 2> = x.flatten(1, 3);
        let x = self.dropout.forward(x);
        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);

        self.fc2.forward(x)
    }

    /// 入力形状の検査
    ///
    /// 32x32 以外の入力は最後の全結合層で形状エラーになるため、事前に弾きます。
    pub fn check_input(dims: [usize; 4]) -> Result<(), TileError> {
        let [_, channels, height, width] = dims;
        if channels != 1 || height != IMAGE_SIZE || width != IMAGE_SIZE {
            return Err(TileError::InputShapeMismatch {
                expected: IMAGE_SIZE,
                actual: dims,
            });
        }
        Ok(())
    }

    /// 出力クラス数
    pub fn num_classes(&self) -> usize {
        self.fc2.weight.val().dims()[1]
    }

    /// 予測を実行
    ///
    /// # 戻り値
    /// - (予測クラスID [batch_size], ロジット)
    pub fn predict(&self, images: Tensor<B, 4>) -> (Tensor<B, 1, Int>, Tensor<B, 2>) {
        let output = self.forward(images);
        let predictions = output.clone().argmax(1).flatten::<1>(0, 1);
        (predictions, output)
    }

    /// 順伝播と損失計算
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }
}
