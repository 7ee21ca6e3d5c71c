//! ONNX形式への出力
//!
//! 学習済みの分類器を推論用グラフとして書き出します。ドロップアウトは
//! 推論時には恒等写像なので省略し、BatchNorm は実行時統計を使います。

use std::fs;
use std::path::Path;

use burn::{
    module::Param,
    tensor::{backend::Backend, Distribution, Tensor},
};
use burn_ndarray::NdArray;
use prost::Message;

use crate::error::{Result, TileError};
use crate::labels::NUM_CLASSES;
use crate::ml::ml_model::{TileClassifier, FEATURE_BLOCKS, IMAGE_SIZE};
use crate::model::checkpoint::{load_checkpoint, load_metadata, log_metadata_info};
use crate::model::onnx_proto::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto,
    ValueInfoProto,
};

pub const IR_VERSION: i64 = 6;
pub const OPSET_VERSION: i64 = 11;
pub const PRODUCER_NAME: &str = "tile_classifier";
pub const INPUT_NAME: &str = "input";
pub const OUTPUT_NAME: &str = "output";
const BATCH_AXIS: &str = "batch";

/// ノードと初期値を順に積み上げるグラフ構築器
#[derive(Default)]
struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
}

impl GraphBuilder {
    fn node(
        &mut self,
        op_type: &str,
        name: &str,
        inputs: &[&str],
        output: &str,
        attributes: Vec<AttributeProto>,
    ) {
        self.nodes.push(NodeProto {
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: vec![output.to_string()],
            name: Some(name.to_string()),
            op_type: Some(op_type.to_string()),
            attribute: attributes,
            ..Default::default()
        });
    }

    fn initializer<B: Backend, const D: usize>(&mut self, name: &str, tensor: Tensor<B, D>) -> Result<String> {
        let dims = tensor.dims();
        let values = tensor
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| TileError::Export(format!("{name}: {e:?}")))?;
        self.initializers.push(TensorProto::float(name, &dims, &values));
        Ok(name.to_string())
    }

    fn param<B: Backend, const D: usize>(&mut self, name: &str, param: &Param<Tensor<B, D>>) -> Result<String> {
        self.initializer(name, param.val())
    }
}

/// 分類器を ONNX の ModelProto に変換
pub fn to_model_proto<B: Backend>(model: &TileClassifier<B>) -> Result<ModelProto> {
    let mut graph = GraphBuilder::default();
    let mut current = INPUT_NAME.to_string();

    for (i, (block, spec)) in model.features.iter().zip(FEATURE_BLOCKS.iter()).enumerate() {
        let prefix = format!("features.{i}");

        let weight = graph.param(&format!("{prefix}.conv.weight"), &block.conv.weight)?;
        let mut conv_inputs = vec![current.clone(), weight];
        if let Some(bias) = &block.conv.bias {
            conv_inputs.push(graph.param(&format!("{prefix}.conv.bias"), bias)?);
        }
        let conv_out = format!("{prefix}.conv");
        graph.node(
            "Conv",
            &conv_out,
            &conv_inputs.iter().map(String::as_str).collect::<Vec<_>>(),
            &conv_out,
            vec![
                AttributeProto::ints("kernel_shape", &[3, 3]),
                AttributeProto::ints("pads", &[1, 1, 1, 1]),
                AttributeProto::ints("strides", &[1, 1]),
                AttributeProto::ints("dilations", &[1, 1]),
                AttributeProto::int("group", 1),
            ],
        );

        let gamma = graph.param(&format!("{prefix}.norm.gamma"), &block.norm.gamma)?;
        let beta = graph.param(&format!("{prefix}.norm.beta"), &block.norm.beta)?;
        let mean = graph.initializer(&format!("{prefix}.norm.running_mean"), block.norm.running_mean.value())?;
        let var = graph.initializer(&format!("{prefix}.norm.running_var"), block.norm.running_var.value())?;
        let norm_out = format!("{prefix}.norm");
        graph.node(
            "BatchNormalization",
            &norm_out,
            &[conv_out.as_str(), gamma.as_str(), beta.as_str(), mean.as_str(), var.as_str()],
            &norm_out,
            vec![AttributeProto::float("epsilon", block.norm.epsilon as f32)],
        );

        let relu_out = format!("{prefix}.relu");
        graph.node("Relu", &relu_out, &[norm_out.as_str()], &relu_out, Vec::new());
        current = relu_out;

        if spec.pool {
            let pool_out = format!("{prefix}.pool");
            graph.node(
                "MaxPool",
                &pool_out,
                &[current.as_str()],
                &pool_out,
                vec![
                    AttributeProto::ints("kernel_shape", &[2, 2]),
                    AttributeProto::ints("strides", &[2, 2]),
                    AttributeProto::ints("pads", &[0, 0, 0, 0]),
                ],
            );
            current = pool_out;
        }
    }

    graph.node("Flatten", "flatten", &[current.as_str()], "flatten", vec![AttributeProto::int("axis", 1)]);

    // Burn の Linear の重みは [入力, 出力] なので transB=0
    let gemm_attributes = || {
        vec![
            AttributeProto::float("alpha", 1.0),
            AttributeProto::float("beta", 1.0),
            AttributeProto::int("transA", 0),
            AttributeProto::int("transB", 0),
        ]
    };
    let fc1_weight = graph.param("fc1.weight", &model.fc1.weight)?;
    let mut fc1_inputs = vec!["flatten".to_string(), fc1_weight];
    if let Some(bias) = &model.fc1.bias {
        fc1_inputs.push(graph.param("fc1.bias", bias)?);
    }
    graph.node(
        "Gemm",
        "fc1",
        &fc1_inputs.iter().map(String::as_str).collect::<Vec<_>>(),
        "fc1",
        gemm_attributes(),
    );
    graph.node("Relu", "fc1.relu", &["fc1"], "fc1.relu", Vec::new());

    let fc2_weight = graph.param("fc2.weight", &model.fc2.weight)?;
    let mut fc2_inputs = vec!["fc1.relu".to_string(), fc2_weight];
    if let Some(bias) = &model.fc2.bias {
        fc2_inputs.push(graph.param("fc2.bias", bias)?);
    }
    graph.node(
        "Gemm",
        "fc2",
        &fc2_inputs.iter().map(String::as_str).collect::<Vec<_>>(),
        OUTPUT_NAME,
        gemm_attributes(),
    );

    Ok(ModelProto {
        ir_version: Some(IR_VERSION),
        producer_name: Some(PRODUCER_NAME.to_string()),
        producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
        model_version: Some(1),
        graph: Some(GraphProto {
            node: graph.nodes,
            name: Some("tile_classifier".to_string()),
            initializer: graph.initializers,
            input: vec![ValueInfoProto::float_tensor(
                INPUT_NAME,
                BATCH_AXIS,
                &[1, IMAGE_SIZE, IMAGE_SIZE],
            )],
            output: vec![ValueInfoProto::float_tensor(
                OUTPUT_NAME,
                BATCH_AXIS,
                &[model.num_classes()],
            )],
            ..Default::default()
        }),
        opset_import: vec![OperatorSetIdProto {
            domain: Some(String::new()),
            version: Some(OPSET_VERSION),
        }],
        ..Default::default()
    })
}

/// 分類器を ONNX ファイルに書き出す
///
/// 書き出す前に 1x1x32x32 の入力で順伝播し、出力形状を確認します。
pub fn export_onnx<B: Backend>(model: &TileClassifier<B>, output: &Path) -> Result<()> {
    let device = model.fc2.weight.val().device();
    let dummy = Tensor::<B, 4>::random([1, 1, IMAGE_SIZE, IMAGE_SIZE], Distribution::Default, &device);
    TileClassifier::<B>::check_input(dummy.dims())?;

    let logits = model.forward(dummy);
    let expected = [1, model.num_classes()];
    if logits.dims() != expected {
        return Err(TileError::Export(format!(
            "unexpected output shape {:?}, expected {:?}",
            logits.dims(),
            expected
        )));
    }

    let proto = to_model_proto(model)?;
    fs::write(output, proto.encode_to_vec())?;
    log::info!("ONNXモデルを出力しました: {} ({} ノード)", output.display(), proto.graph.map_or(0, |g| g.node.len()));
    Ok(())
}

/// チェックポイントを CPU で読み込み、ONNX ファイルに書き出す
pub fn export_checkpoint(model_path: &Path, output: &Path) -> Result<()> {
    type Cpu = NdArray<f32>;
    let device = Default::default();

    if let Ok(Some(metadata)) = load_metadata(model_path) {
        log_metadata_info(&metadata);
    }

    let model = load_checkpoint::<Cpu>(model_path, NUM_CLASSES, &device)?;
    export_onnx(&model, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::ml_model::ModelConfig;
    use crate::model::onnx_proto::{tensor_shape_proto::dimension::Value as Dim, type_proto};

    type TestBackend = NdArray<f32>;

    #[test]
    fn graph_has_expected_layout() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let proto = to_model_proto(&model).unwrap();

        assert_eq!(proto.ir_version, Some(IR_VERSION));
        assert_eq!(proto.opset_import[0].version, Some(OPSET_VERSION));

        let graph = proto.graph.unwrap();
        let ops: Vec<&str> = graph.node.iter().filter_map(|n| n.op_type.as_deref()).collect();
        assert_eq!(ops.iter().filter(|op| **op == "Conv").count(), 4);
        assert_eq!(ops.iter().filter(|op| **op == "BatchNormalization").count(), 4);
        assert_eq!(ops.iter().filter(|op| **op == "MaxPool").count(), 3);
        assert_eq!(ops.iter().filter(|op| **op == "Gemm").count(), 2);
        assert!(!ops.contains(&"Dropout"));

        let last = graph.node.last().unwrap();
        assert_eq!(last.output, vec![OUTPUT_NAME.to_string()]);

        let fc2 = graph
            .initializer
            .iter()
            .find(|t| t.name.as_deref() == Some("fc2.weight"))
            .unwrap();
        assert_eq!(fc2.dims, vec![128, NUM_CLASSES as i64]);
        assert_eq!(fc2.raw_data.as_ref().unwrap().len(), 128 * NUM_CLASSES * 4);
    }

    fn batch_axis(info: &ValueInfoProto) -> Option<Dim> {
        match info.r#type.as_ref()?.value.as_ref()? {
            type_proto::Value::TensorType(tensor) => tensor.shape.as_ref()?.dim.first()?.value.clone(),
        }
    }

    #[test]
    fn input_and_output_share_symbolic_batch_axis() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let graph = to_model_proto(&model).unwrap().graph.unwrap();

        let batch = Some(Dim::DimParam("batch".to_string()));
        assert_eq!(batch_axis(&graph.input[0]), batch);
        assert_eq!(batch_axis(&graph.output[0]), batch);
    }

    #[test]
    fn batch_norm_inputs_follow_operator_order() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let graph = to_model_proto(&model).unwrap().graph.unwrap();

        let norm = graph
            .node
            .iter()
            .find(|n| n.op_type.as_deref() == Some("BatchNormalization"))
            .unwrap();
        assert_eq!(
            norm.input,
            vec![
                "features.0.conv",
                "features.0.norm.gamma",
                "features.0.norm.beta",
                "features.0.norm.running_mean",
                "features.0.norm.running_var",
            ]
        );
    }

    #[test]
    fn encoded_model_decodes_back() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let proto = to_model_proto(&model).unwrap();

        let decoded = ModelProto::decode(proto.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, proto);
    }

    #[test]
    fn missing_checkpoint_fails_export() {
        let dir = std::env::temp_dir().join(format!("tile_onnx_missing_{}", std::process::id()));
        let err = export_checkpoint(&dir.join("none.mpk"), &dir.join("model.onnx")).unwrap_err();
        assert!(matches!(err, TileError::Io(_)));
    }
}
