// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/fcos_postprocess.rs - FCOS get_bboxes 重写的端到端测试
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::io::Write;

use ndarray::Array4;
use serde_json::{Value, json};
use url::Url;

use shanan_deploy::{
  FromUrl,
  config::{DeployConfig, TestConfig},
  model::{
    BboxOutput, DenseHead, FCOS_HEAD_GET_BBOXES, FcosHead, GetBboxes, GetBboxesArgs, ImageMeta,
    register_rewriters,
  },
  postprocess::PostprocessError,
  rewrite::{Dispatcher, RewriteRegistry},
};

const NUM_CLASSES: usize = 2;

fn registry() -> RewriteRegistry {
  let mut registry = RewriteRegistry::new();
  register_rewriters(&mut registry).unwrap();
  registry
}

fn deploy(backend: &str, extra: Value) -> DeployConfig {
  let mut tree = json!({
    "backend_config": { "type": backend },
    "onnx_config": { "type": "onnx", "input_names": ["input"], "input_shape": [16, 16] },
    "codebase_config": {
      "type": "mmdet",
      "post_processing": {
        "score_threshold": 0.05,
        "iou_threshold": 0.5,
        "max_output_boxes_per_class": 200,
        "pre_top_k": 5000,
        "keep_top_k": 100
      }
    }
  });
  if let (Some(tree), Some(extra)) = (tree.as_object_mut(), extra.as_object()) {
    for (k, v) in extra {
      tree.insert(k.clone(), v.clone());
    }
  }
  DeployConfig::from_value(tree).unwrap()
}

/// 单层 2x2 特征图，步长 8；锚点 0 属于类别 0，锚点 3 属于类别 1
fn head_outputs(batch: usize) -> GetBboxesArgs {
  let cls = Array4::from_shape_fn((batch, NUM_CLASSES, 2, 2), |(_, c, y, x)| {
    match (c, y * 2 + x) {
      (0, 0) | (1, 3) => 10.0,
      _ => -10.0,
    }
  });
  let reg = Array4::from_elem((batch, 4, 2, 2), 2.0f32);
  let centerness = Array4::zeros((batch, 1, 2, 2));
  GetBboxesArgs::new(vec![cls], vec![reg]).with_centernesses(vec![centerness])
}

fn head() -> FcosHead {
  FcosHead::new(NUM_CLASSES, vec![8])
}

fn suppressed(output: BboxOutput) -> Vec<shanan_deploy::model::DetectResult> {
  match output {
    BboxOutput::Suppressed(images) => images,
    other => panic!("expected suppressed output, got {:?}", other),
  }
}

#[cfg(feature = "backend_ncnn")]
#[test]
fn ncnn_rewrite_end_to_end() {
  let registry = registry();
  let cfg = deploy("ncnn", json!({}));
  let dispatcher = Dispatcher::new(&registry, &cfg).unwrap();
  let head = head();

  let guard = dispatcher
    .patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES)
    .unwrap();
  let args = head_outputs(1).with_img_metas(vec![ImageMeta {
    img_shape: Some((12, 12)),
  }]);
  let images = suppressed(guard.call(args).unwrap());

  assert_eq!(images.len(), 1);
  let result = &images[0];
  assert_eq!(result.labels(), vec![0, 1]);
  assert_eq!(result.boxes(), vec![[2.0, 2.0, 6.0, 6.0], [10.0, 10.0, 12.0, 12.0]]);
  for score in result.scores() {
    assert!((score - 0.5).abs() < 1e-3);
  }
}

#[cfg(feature = "backend_ncnn")]
#[test]
fn ncnn_and_portable_variants_agree() {
  let registry = registry();
  let head = head();

  let ncnn = deploy("ncnn", json!({}));
  let dispatcher = Dispatcher::new(&registry, &ncnn).unwrap();
  let guard = dispatcher.patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES).unwrap();
  let padded = guard.call(head_outputs(1)).unwrap();
  drop(guard);

  let ort = deploy("onnxruntime", json!({}));
  let dispatcher = Dispatcher::new(&registry, &ort).unwrap();
  let guard = dispatcher.patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES).unwrap();
  let implicit = guard.call(head_outputs(1)).unwrap();

  assert_eq!(padded, implicit);
}

#[cfg(feature = "backend_ncnn")]
#[test]
fn ncnn_rejects_batches() {
  let registry = registry();
  let cfg = deploy("ncnn", json!({}));
  let dispatcher = Dispatcher::new(&registry, &cfg).unwrap();
  let head = head();
  let guard = dispatcher.patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES).unwrap();

  assert!(matches!(
    guard.call(head_outputs(2)),
    Err(PostprocessError::BatchSize(2))
  ));
}

#[cfg(feature = "backend_ncnn")]
#[test]
fn ncnn_rejects_dynamic_shape_config() {
  let registry = registry();
  let cfg = deploy(
    "ncnn",
    json!({
      "onnx_config": {
        "input_names": ["input"],
        "dynamic_axes": { "input": { "0": "batch", "2": "height", "3": "width" } }
      }
    }),
  );
  let dispatcher = Dispatcher::new(&registry, &cfg).unwrap();
  let head = head();
  let guard = dispatcher.patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES).unwrap();

  let err = guard.call(head_outputs(1)).unwrap_err();
  assert!(matches!(err, PostprocessError::Config(_)));
}

#[test]
fn level_count_mismatch_is_fatal() {
  let registry = registry();
  let cfg = deploy("onnxruntime", json!({}));
  let dispatcher = Dispatcher::new(&registry, &cfg).unwrap();
  let head = FcosHead::new(NUM_CLASSES, vec![8, 16, 32]);
  let guard = dispatcher.patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES).unwrap();

  let cls = Array4::<f32>::zeros((1, NUM_CLASSES, 2, 2));
  let reg = Array4::<f32>::zeros((1, 4, 2, 2));
  let args = GetBboxesArgs::new(vec![cls.clone(), cls.clone(), cls], vec![reg.clone(), reg]);

  match guard.call(args) {
    Err(PostprocessError::LevelMismatch {
      left,
      left_len,
      right,
      right_len,
    }) => {
      assert_eq!((left, left_len, right, right_len), ("cls_scores", 3, "bbox_preds", 2));
    }
    other => panic!("unexpected result: {:?}", other),
  }
}

#[test]
fn portable_variant_honours_batch_inference_flag() {
  let registry = registry();
  let head = head();

  let single = deploy("onnxruntime", json!({}));
  let dispatcher = Dispatcher::new(&registry, &single).unwrap();
  let guard = dispatcher.patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES).unwrap();
  assert!(matches!(
    guard.call(head_outputs(2)),
    Err(PostprocessError::BatchSize(2))
  ));
  drop(guard);

  let batched = deploy(
    "onnxruntime",
    json!({
      "codebase_config": { "post_processing": {}, "batch_inference": true }
    }),
  );
  let dispatcher = Dispatcher::new(&registry, &batched).unwrap();
  let guard = dispatcher.patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES).unwrap();
  let images = suppressed(guard.call(head_outputs(2)).unwrap());
  assert_eq!(images.len(), 2);
  assert_eq!(images[0], images[1]);
}

#[test]
fn without_nms_returns_decoded_candidates() {
  let registry = registry();
  let cfg = deploy("onnxruntime", json!({}));
  let dispatcher = Dispatcher::new(&registry, &cfg).unwrap();
  let head = head();
  let guard = dispatcher.patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES).unwrap();

  match guard.call(head_outputs(1).with_nms(false)).unwrap() {
    BboxOutput::Raw(images) => {
      let decoded = &images[0];
      assert_eq!(decoded.boxes.shape(), &[4, 4]);
      assert_eq!(decoded.scores.shape(), &[4, NUM_CLASSES]);
      assert_eq!(decoded.confidence.shape(), &[4, 1]);
      assert!(decoded.confidence.iter().all(|&c| (c - 0.5).abs() < 1e-6));
      assert_eq!(decoded.boxes.row(3).to_vec(), vec![10.0, 10.0, 14.0, 14.0]);
    }
    other => panic!("expected raw output, got {:?}", other),
  }
}

#[test]
fn per_call_cfg_overrides_deploy_defaults() {
  let registry = registry();
  let cfg = deploy("onnxruntime", json!({}));
  let dispatcher = Dispatcher::new(&registry, &cfg).unwrap();
  let head = head();
  let guard = dispatcher.patch::<GetBboxes>(&head, FCOS_HEAD_GET_BBOXES).unwrap();

  let strict: TestConfig = serde_json::from_value(json!({ "score_thr": 0.6 })).unwrap();
  let images = suppressed(guard.call(head_outputs(1).with_cfg(strict)).unwrap());
  assert!(images[0].is_empty());

  let capped: TestConfig = serde_json::from_value(json!({ "max_per_img": 1 })).unwrap();
  let images = suppressed(guard.call(head_outputs(1).with_cfg(capped)).unwrap());
  assert_eq!(images[0].len(), 1);
}

#[test]
fn unpatched_head_uses_original_implementation() {
  let registry = registry();
  // 缺少 post_processing 时重写会失败，原始实现不读取部署配置
  let cfg = DeployConfig::from_value(json!({ "backend_config": { "type": "onnxruntime" } })).unwrap();
  let dispatcher = Dispatcher::new(&registry, &cfg).unwrap();
  let head = head();
  let target: &(dyn DenseHead + 'static) = &head;

  let images = suppressed(
    dispatcher
      .invoke::<GetBboxes>(target, FCOS_HEAD_GET_BBOXES, head_outputs(1))
      .unwrap(),
  );
  assert_eq!(images[0].len(), 2);

  let guard = dispatcher.patch::<GetBboxes>(target, FCOS_HEAD_GET_BBOXES).unwrap();
  assert!(matches!(
    guard.call(head_outputs(1)),
    Err(PostprocessError::Config(_))
  ));
}

#[test]
fn deploy_config_loads_from_file_url() {
  let mut file = tempfile::NamedTempFile::new().unwrap();
  let text = serde_json::to_string(deploy("onnxruntime", json!({})).as_value()).unwrap();
  file.write_all(text.as_bytes()).unwrap();
  file.flush().unwrap();

  let url = Url::from_file_path(file.path()).unwrap();
  let cfg = DeployConfig::from_url(&url).unwrap();
  assert_eq!(cfg.input_shape().unwrap(), Some((16, 16)));
  assert_eq!(cfg.post_processing_params().unwrap().keep_top_k(), Some(100));

  let wrong = Url::parse("http://example.com/deploy.json").unwrap();
  assert!(DeployConfig::from_url(&wrong).is_err());
}
