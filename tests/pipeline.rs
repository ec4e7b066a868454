use eegnet_golden::stimuli::{random_input, synthetic_network};
use eegnet_golden::{
    compare, Clip, GoldenError, GoldenModel, Layer, ModelOptions, NamedTensors, NetParams, Tensor, FUSED_TOLERANCE,
};
use pretty_assertions::assert_eq;

fn setup(seed: u64) -> (NamedTensors, NetParams, Tensor<f64>) {
    let p = NetParams::new(4, 128, 2, 2, 3);
    let (net, x) = synthetic_network(&p, seed).unwrap();
    (net, p, x)
}

fn fused() -> ModelOptions {
    ModelOptions { fuse_layer_1_2: true, ..ModelOptions::default() }
}

#[test]
fn infer_is_deterministic() {
    let (net, p, x) = setup(1);
    let model = GoldenModel::new(&net, p, ModelOptions::default()).unwrap();
    let input = model.quantize_input(&x).unwrap();
    let a = model.infer(&input).unwrap();
    let b = model.infer(&input).unwrap();
    assert_eq!(a, b);
    assert_eq!(a.shape(), &[3]);
    let again = GoldenModel::new(&net, p, ModelOptions::default()).unwrap();
    assert_eq!(again.infer(&input).unwrap(), a);
}

#[test]
fn trace_ends_with_the_inferred_output() {
    let (net, p, _) = setup(2);
    for opts in [ModelOptions::default(), fused()] {
        let model = GoldenModel::new(&net, p, opts).unwrap();
        let input = random_input(model.input_shape(), -60, 60, 5).unwrap();
        let trace = model.trace(&input).unwrap();
        assert_eq!(trace.len(), model.layers().len());
        assert_eq!(trace.last(), Some(&model.infer(&input).unwrap()));
        for (y, layer) in trace.iter().zip(model.layers()) {
            assert_eq!(y.shape(), layer.output_shape().as_slice());
        }
    }
}

#[test]
fn fused_layers_stay_within_tolerance() {
    for seed in 0..4 {
        let (net, p, x) = setup(seed);
        let sequential = GoldenModel::new(&net, p, ModelOptions::default()).unwrap();
        let fused = GoldenModel::new(&net, p, fused()).unwrap();
        assert!(fused.pipeline().is_fused());
        let input = sequential.quantize_input(&x).unwrap();
        let a = sequential.trace(&input).unwrap();
        let b = fused.trace(&input).unwrap();
        let result = compare(&a[1], &b[0], FUSED_TOLERANCE).unwrap();
        assert!(result.passed, "seed {}: {:?}", seed, result);
    }
}

#[test]
fn reordered_batch_norm_is_a_separate_valid_pipeline() {
    let (net, p, x) = setup(3);
    // without saturation the two orderings differ only by rounding
    let unclipped = ModelOptions { clip: Clip::Off, ..ModelOptions::default() };
    let default = GoldenModel::new(&net, p, unclipped).unwrap();
    let reordered = GoldenModel::new(&net, p, ModelOptions { reorder_bn: true, ..unclipped }).unwrap();
    let input = default.quantize_input(&x).unwrap();
    let a = default.trace(&input).unwrap();
    let b = reordered.trace(&input).unwrap();
    assert_eq!(a[0], b[0]);
    assert_eq!(b[1].shape(), a[1].shape());
    assert!(compare(&a[1], &b[1], FUSED_TOLERANCE).unwrap().passed);
}

#[test]
fn fusion_requires_pool_first_ordering() {
    let (net, p, _) = setup(4);
    let opts = ModelOptions { reorder_bn: true, fuse_layer_1_2: true, ..ModelOptions::default() };
    assert!(matches!(GoldenModel::new(&net, p, opts), Err(GoldenError::InvalidConfig(_))));
}

#[test]
fn floor_division_never_exceeds_rounding() {
    let (net, p, x) = setup(5);
    let nearest = GoldenModel::new(&net, p, ModelOptions::default()).unwrap();
    let floor = GoldenModel::new(&net, p, ModelOptions { round: false, ..ModelOptions::default() }).unwrap();
    let input = nearest.quantize_input(&x).unwrap();
    let a = nearest.trace(&input).unwrap();
    let b = floor.trace(&input).unwrap();
    assert!(b[0].data().iter().zip(a[0].data()).all(|(f, n)| f <= n));
}

#[test]
fn unbalanced_clip_stays_in_int8_range() {
    let (net, p, _) = setup(6);
    let model = GoldenModel::new(&net, p, ModelOptions { clip: Clip::Unbalanced, ..ModelOptions::default() }).unwrap();
    let input = Tensor::from_fn(model.input_shape(), |i| if i % 2 == 0 { 127 } else { -127 });
    let out = model.trace(&input).unwrap();
    assert!(out.iter().all(|y| y.data().iter().all(|v| (-128..=127).contains(v))));
}

#[test]
fn configuration_errors_are_fatal() {
    let (net, p, _) = setup(7);
    let levels = NetParams { act_levels: 127, ..p };
    assert!(matches!(GoldenModel::new(&net, levels, ModelOptions::default()), Err(GoldenError::UnsupportedLevels { .. })));
    let other = NetParams::new(4, 256, 2, 2, 3);
    assert!(matches!(GoldenModel::new(&net, other, ModelOptions::default()), Err(GoldenError::ShapeMismatch { .. })));
    let model = GoldenModel::new(&net, p, ModelOptions::default()).unwrap();
    assert!(model.quantize_input(&Tensor::zeros(vec![4, 127])).is_err());
    assert!(model.infer(&Tensor::zeros(vec![3, 128])).is_err());
}

#[test]
fn summary_reports_total_memory() {
    let (net, p, _) = setup(8);
    let model = GoldenModel::new(&net, p, ModelOptions::default()).unwrap();
    assert_eq!(model.mem_size(), 144 + 48 + 68 + 48 + 27);
    assert_eq!(model.num_params(), 132 + 24 + 65 + 24 + 27);
    let text = model.to_string();
    assert!(text.starts_with("Layer 1: Convolution in Time + Batch Norm\n"));
    assert!(text.ends_with("Total Memory: 335 B"));
    assert_eq!(model.dims().t8, 16);
    assert_eq!(model.output_scale(), net.scalar("quant6.absMaxValue").unwrap());
}

#[test]
fn inputs_off_the_quantization_grid_are_rejected() {
    let (net, p, _) = setup(9);
    for opts in [ModelOptions::default(), fused()] {
        let model = GoldenModel::new(&net, p, opts).unwrap();
        let mut input = random_input(model.input_shape(), -60, 60, 9).unwrap();
        input.data_mut()[17] = 200;
        let err = model.infer(&input).unwrap_err();
        assert_eq!(err, GoldenError::OutOfRange { context: model.layers()[0].name().to_string(), value: 200, min: -127, max: 127 });
        assert!(model.trace(&input).is_err());
        let huge = Tensor::from_fn(model.input_shape(), |_| 40_000_000);
        assert!(matches!(model.infer(&huge), Err(GoldenError::OutOfRange { .. })));
    }
}
